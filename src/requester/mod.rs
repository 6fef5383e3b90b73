//! The HTTP requester: one instance per (step, proxy) pair.
//!
//! Construction pre-parses the scenario step into an immutable request
//! template and precomputes which fields contain dynamic or environment
//! placeholders, so sends without placeholders skip substitution
//! entirely. Each send prepares a concrete request, dials or reuses a
//! connection with per-phase timing, executes the exchange under the
//! step's timeout, drains the response body, and runs captures.

pub(crate) mod connect;
pub mod timing;

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use flate2::read::GzDecoder;
use http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONNECTION,
    CONTENT_ENCODING, CONTENT_LENGTH, HOST, LOCATION, PROXY_AUTHORIZATION, USER_AGENT,
};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use tokio_util::sync::CancellationToken;
use url::{Position, Url};
use uuid::Uuid;

use crate::error::{EngineError, RequestError};
use crate::extract;
use crate::inject;
use crate::result::{DebugDump, StepResult};
use crate::scenario::{BasicAuth, CaptureConfig, ScenarioStep, StepOptions};

use connect::{dial, proxy_authorization, DialConfig, Endpoint, Established, HttpSender};
use timing::RequestTrace;

/// Redirect-following ceiling, matching common client defaults.
const MAX_REDIRECTS: usize = 10;

/// Response header carrying server-side processing time, seconds.
const SERVER_TIME_HEADER: &str = "x-server-response-time";

/// Which substitutions a template field needs at send time.
#[derive(Debug, Clone, Copy, Default)]
struct FieldFlags {
    dynamic: bool,
    env: bool,
}

impl FieldFlags {
    fn scan(value: &str) -> Self {
        Self {
            dynamic: inject::has_dynamic(value),
            env: inject::has_env(value),
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            dynamic: self.dynamic || other.dynamic,
            env: self.env || other.env,
        }
    }

    fn any(&self) -> bool {
        self.dynamic || self.env
    }
}

/// Immutable, pre-parsed request template for one scenario step.
#[derive(Debug)]
struct RequestTemplate {
    method: Method,
    url_raw: String,
    url_flags: FieldFlags,
    /// Header pairs with `Host` lifted out.
    headers: Vec<(String, String)>,
    header_flags: FieldFlags,
    host_override: Option<String>,
    payload: Bytes,
    /// UTF-8 view of the payload, when substitution could apply.
    payload_text: Option<String>,
    payload_flags: FieldFlags,
    auth: Option<BasicAuth>,
    auth_flags: FieldFlags,
    timeout: Duration,
    options: StepOptions,
}

/// A fully substituted request, ready for the wire.
#[derive(Debug)]
struct Prepared {
    method: Method,
    url: Url,
    https: bool,
    headers: HeaderMap,
    body: Bytes,
}

/// Outcome of the exchange (after redirects, body drained).
struct HopOutcome {
    status: u16,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    content_length: i64,
    request_headers: Vec<(String, String)>,
}

/// Sends one scenario step, possibly many times concurrently.
#[derive(Debug)]
pub struct HttpRequester {
    step_id: u16,
    step_name: String,
    captures: Vec<CaptureConfig>,
    template: RequestTemplate,
    tls: Arc<rustls::ClientConfig>,
    proxy: Option<Url>,
    cancel: CancellationToken,
    debug: bool,
    pool: StdMutex<HashMap<String, Vec<Established>>>,
}

impl HttpRequester {
    /// Pre-parse `step` into a requester bound to `proxy`.
    ///
    /// Dynamic placeholders are resolved once here so unknown generator
    /// names fail before the first worker launches.
    pub fn new(
        step: &ScenarioStep,
        proxy: Option<Url>,
        cancel: CancellationToken,
        debug: bool,
    ) -> Result<Self, EngineError> {
        let mut headers = Vec::with_capacity(step.headers.len());
        let mut host_override = None;
        let mut header_flags = FieldFlags::default();
        for (k, v) in &step.headers {
            if k.eq_ignore_ascii_case("host") {
                host_override = Some(v.clone());
                continue;
            }
            header_flags = header_flags.merge(FieldFlags::scan(k)).merge(FieldFlags::scan(v));
            headers.push((k.clone(), v.clone()));
        }

        let url_flags = FieldFlags::scan(&step.url);
        let payload_text = String::from_utf8(step.payload.clone()).ok();
        let payload_flags = payload_text
            .as_deref()
            .map(FieldFlags::scan)
            .unwrap_or_default();
        let auth_flags = step
            .auth
            .as_ref()
            .map(|a| FieldFlags::scan(&a.username).merge(FieldFlags::scan(&a.password)))
            .unwrap_or_default();

        let check_dynamic = |flags: FieldFlags, value: &str| -> Result<(), EngineError> {
            if flags.dynamic {
                inject::inject_dynamic(value)
                    .map_err(|e| EngineError::validation(format!("step {}: {e}", step.id)))?;
            }
            Ok(())
        };
        check_dynamic(url_flags, &step.url)?;
        if let Some(text) = &payload_text {
            check_dynamic(payload_flags, text)?;
        }
        for (k, v) in &headers {
            check_dynamic(FieldFlags::scan(k), k)?;
            check_dynamic(FieldFlags::scan(v), v)?;
        }
        if let Some(auth) = &step.auth {
            check_dynamic(FieldFlags::scan(&auth.username), &auth.username)?;
            check_dynamic(FieldFlags::scan(&auth.password), &auth.password)?;
        }

        let tls = match &step.tls_identity {
            Some(identity) => connect::insecure_tls_config_with_identity(step.options.h2, identity)
                .map_err(|e| EngineError::validation(format!("step {}: {e}", step.id)))?,
            None => connect::insecure_tls_config(step.options.h2),
        };

        Ok(Self {
            step_id: step.id,
            step_name: step.name.clone(),
            captures: step.captures.clone(),
            template: RequestTemplate {
                method: step.method.clone(),
                url_raw: step.url.clone(),
                url_flags,
                headers,
                header_flags,
                host_override,
                payload: Bytes::from(step.payload.clone()),
                payload_text,
                payload_flags,
                auth: step.auth.clone(),
                auth_flags,
                timeout: Duration::from_secs(step.timeout_secs),
                options: step.options.clone(),
            },
            tls: Arc::new(tls),
            proxy,
            cancel,
            debug,
            pool: StdMutex::new(HashMap::new()),
        })
    }

    /// Execute the step once against the given environment.
    pub async fn send(&self, envs: &HashMap<String, String>) -> StepResult {
        let started_at = Instant::now();
        let request_id = Uuid::new_v4();
        let usable = envs.clone();
        let trace = Arc::new(RequestTrace::new());

        let prepared = match self.prepare(envs) {
            Ok(p) => p,
            Err(reason) => {
                return StepResult {
                    step_id: self.step_id,
                    step_name: self.step_name.clone(),
                    request_id,
                    status_code: 0,
                    started_at,
                    total_duration: Duration::ZERO,
                    content_length: 0,
                    error: Some(RequestError::invalid_request(reason)),
                    durations: Default::default(),
                    extracted: HashMap::new(),
                    usable,
                    failed_captures: HashMap::new(),
                    debug: None,
                };
            }
        };

        let buffer_body = !self.captures.is_empty() || self.debug;
        let outcome = tokio::select! {
            res = tokio::time::timeout(
                self.template.timeout,
                self.exchange(&prepared, buffer_body, &trace),
            ) => match res {
                Ok(inner) => inner,
                Err(_) => Err("deadline has elapsed".to_string()),
            },
            _ = self.cancel.cancelled() => Err("context canceled".to_string()),
        };
        trace.finish_read();

        let mut extracted = HashMap::new();
        let mut failed_captures = HashMap::new();

        match outcome {
            Ok(hop) => {
                let (body, content_length) = self.decode_body(&hop);
                self.run_captures(&hop.headers, body.as_deref(), &mut extracted, &mut failed_captures);

                let mut durations = trace.snapshot(prepared.https);
                durations.server_reported = server_reported(&hop.headers);
                let total_duration = durations.total();

                let debug = self.debug.then(|| DebugDump {
                    url: prepared.url.to_string(),
                    method: prepared.method.to_string(),
                    request_headers: hop.request_headers.clone(),
                    request_body: prepared.body.to_vec(),
                    response_headers: header_pairs(&hop.headers),
                    response_body: body.clone().unwrap_or_default(),
                });

                StepResult {
                    step_id: self.step_id,
                    step_name: self.step_name.clone(),
                    request_id,
                    status_code: hop.status,
                    started_at,
                    total_duration,
                    content_length,
                    error: None,
                    durations,
                    extracted,
                    usable,
                    failed_captures,
                    debug,
                }
            }
            Err(message) => {
                // Bind every configured capture to an empty value so later
                // steps still resolve their placeholders.
                for conf in &self.captures {
                    extracted.insert(conf.name.clone(), String::new());
                    failed_captures.insert(conf.name.clone(), "request failed".to_string());
                }
                let durations = trace.snapshot(prepared.https);
                StepResult {
                    step_id: self.step_id,
                    step_name: self.step_name.clone(),
                    request_id,
                    status_code: 0,
                    started_at,
                    total_duration: durations.total(),
                    content_length: 0,
                    error: Some(RequestError::classify_transport(&message)),
                    durations,
                    extracted,
                    usable,
                    failed_captures,
                    debug: None,
                }
            }
        }
    }

    /// Drop all idle connections. Called once when the test completes.
    pub fn shutdown(&self) {
        self.pool.lock().expect("pool lock").clear();
    }

    fn prepare(&self, envs: &HashMap<String, String>) -> Result<Prepared, String> {
        let t = &self.template;

        let mut url_str = t.url_raw.clone();
        if t.url_flags.dynamic {
            url_str = inject::inject_dynamic(&url_str).map_err(|e| e.to_string())?;
        }
        if t.url_flags.env {
            url_str = inject::inject_env(&url_str, envs).map_err(|e| e.to_string())?;
        }
        let url = Url::parse(&url_str)
            .map_err(|e| format!("target is not valid: {url_str} ({e})"))?;
        let https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(format!("unsupported scheme {other}: {url_str}")),
        };

        let body = match (&t.payload_text, t.payload_flags.any()) {
            (Some(text), true) => {
                let mut b = text.clone();
                if t.payload_flags.dynamic {
                    b = inject::inject_dynamic(&b).map_err(|e| e.to_string())?;
                }
                if t.payload_flags.env {
                    b = inject::inject_env(&b, envs).map_err(|e| e.to_string())?;
                }
                Bytes::from(b)
            }
            _ => t.payload.clone(),
        };

        let mut headers = HeaderMap::new();
        for (k, v) in &t.headers {
            let (mut name, mut value) = (k.clone(), v.clone());
            if t.header_flags.dynamic {
                name = inject::inject_dynamic(&name).map_err(|e| e.to_string())?;
                value = inject::inject_dynamic(&value).map_err(|e| e.to_string())?;
            }
            if t.header_flags.env {
                name = inject::inject_env(&name, envs).map_err(|e| e.to_string())?;
                value = inject::inject_env(&value, envs).map_err(|e| e.to_string())?;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| format!("invalid header name {name}: {e}"))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| format!("invalid header value for {name}: {e}"))?;
            headers.append(name, value);
        }

        if !headers.contains_key(USER_AGENT) {
            headers.insert(
                USER_AGENT,
                HeaderValue::from_static(concat!("volley/", env!("CARGO_PKG_VERSION"))),
            );
        }
        if !t.options.disable_compression && !headers.contains_key(ACCEPT_ENCODING) {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }
        if !t.options.keep_alive {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }

        if let Some(auth) = &t.auth {
            let (mut user, mut pass) = (auth.username.clone(), auth.password.clone());
            if t.auth_flags.dynamic {
                user = inject::inject_dynamic(&user).map_err(|e| e.to_string())?;
                pass = inject::inject_dynamic(&pass).map_err(|e| e.to_string())?;
            }
            if t.auth_flags.env {
                user = inject::inject_env(&user, envs).map_err(|e| e.to_string())?;
                pass = inject::inject_env(&pass, envs).map_err(|e| e.to_string())?;
            }
            let value = format!("Basic {}", BASE64.encode(format!("{user}:{pass}")));
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&value).map_err(|e| format!("invalid credentials: {e}"))?,
            );
        }

        // Plain HTTP through a proxy travels in absolute form; credentials
        // ride along on every request.
        if !https {
            if let Some(proxy) = &self.proxy {
                if let Some(value) = proxy_authorization(proxy) {
                    headers.insert(
                        PROXY_AUTHORIZATION,
                        HeaderValue::from_str(&value)
                            .map_err(|e| format!("invalid proxy credentials: {e}"))?,
                    );
                }
            }
        }

        Ok(Prepared {
            method: t.method.clone(),
            url,
            https,
            headers,
            body,
        })
    }

    async fn exchange(
        &self,
        prepared: &Prepared,
        buffer: bool,
        trace: &Arc<RequestTrace>,
    ) -> Result<HopOutcome, String> {
        let mut url = prepared.url.clone();
        let mut method = prepared.method.clone();
        let mut body = prepared.body.clone();
        let mut sent_headers: Option<Vec<(String, String)>> = None;

        for hop in 0..=MAX_REDIRECTS {
            let endpoint = Endpoint::from_url(&url)?;
            let pooled = hop == 0 && self.template.options.keep_alive;
            let mut conn = self.checkout(&endpoint, pooled, trace).await?;
            conn.slot.install(trace.clone());

            let is_h2 = matches!(conn.sender, HttpSender::H2(_));
            let req = build_request(
                prepared,
                &url,
                &method,
                &body,
                conn.absolute_form,
                is_h2,
                self.template.host_override.as_deref(),
            )?;
            if sent_headers.is_none() {
                sent_headers = Some(header_pairs(req.headers()));
            }

            let response = match &mut conn.sender {
                HttpSender::H1(s) => s.send_request(req).await.map_err(|e| e.to_string())?,
                HttpSender::H2(s) => {
                    let sent_at = Instant::now();
                    let r = s.send_request(req).await.map_err(|e| e.to_string())?;
                    trace.set_server_wait(sent_at.elapsed());
                    r
                }
            };

            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let content_length = headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(-1);

            // Always drain the body so the connection can be reused.
            let read_start = Instant::now();
            let mut collected: Option<Vec<u8>> = buffer.then(Vec::new);
            let mut incoming = response.into_body();
            while let Some(frame) = incoming.frame().await {
                let frame = frame.map_err(|e| e.to_string())?;
                if let Some(data) = frame.data_ref() {
                    if let Some(buf) = collected.as_mut() {
                        buf.extend_from_slice(data);
                    }
                }
            }
            if is_h2 {
                trace.set_response_read(read_start.elapsed());
            }

            conn.slot.clear();
            let closing = headers
                .get(CONNECTION)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("close"))
                .unwrap_or(false);
            if pooled && !closing && !conn.sender.is_closed() {
                self.checkin(endpoint.pool_key(), conn);
            }

            if !self.template.options.disable_redirect && is_redirect(status) {
                if let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
                    if hop == MAX_REDIRECTS {
                        return Err(format!("stopped after {MAX_REDIRECTS} redirects"));
                    }
                    url = url
                        .join(location)
                        .map_err(|e| format!("invalid redirect location {location}: {e}"))?;
                    if matches!(status, 301 | 302 | 303)
                        && method != Method::GET
                        && method != Method::HEAD
                    {
                        method = Method::GET;
                        body = Bytes::new();
                    }
                    continue;
                }
            }

            return Ok(HopOutcome {
                status,
                headers,
                body: collected,
                content_length,
                request_headers: sent_headers.unwrap_or_default(),
            });
        }
        Err(format!("stopped after {MAX_REDIRECTS} redirects"))
    }

    async fn checkout(
        &self,
        endpoint: &Endpoint,
        pooled: bool,
        trace: &Arc<RequestTrace>,
    ) -> Result<Established, String> {
        if pooled {
            loop {
                let candidate = {
                    let mut pool = self.pool.lock().expect("pool lock");
                    pool.get_mut(&endpoint.pool_key()).and_then(Vec::pop)
                };
                let Some(mut conn) = candidate else { break };
                if conn.sender.is_closed() {
                    continue;
                }
                let ready = match &mut conn.sender {
                    HttpSender::H1(s) => s.ready().await.is_ok(),
                    HttpSender::H2(s) => s.ready().await.is_ok(),
                };
                if ready {
                    return Ok(conn);
                }
            }
        }

        let cfg = DialConfig {
            proxy: self.proxy.clone(),
            tls: self.tls.clone(),
            sni_override: self.template.options.hostname.clone(),
            h2: self.template.options.h2,
        };
        dial(endpoint, &cfg, trace).await
    }

    fn checkin(&self, key: String, conn: Established) {
        self.pool
            .lock()
            .expect("pool lock")
            .entry(key)
            .or_default()
            .push(conn);
    }

    fn decode_body(&self, hop: &HopOutcome) -> (Option<Vec<u8>>, i64) {
        let gzip = hop
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false);

        match (&hop.body, gzip) {
            (Some(raw), true) => {
                let mut out = Vec::new();
                match GzDecoder::new(raw.as_slice()).read_to_end(&mut out) {
                    Ok(_) => (Some(out), -1),
                    Err(_) => (Some(raw.clone()), hop.content_length),
                }
            }
            (Some(raw), false) => (Some(raw.clone()), hop.content_length),
            (None, _) => (None, hop.content_length),
        }
    }

    fn run_captures(
        &self,
        headers: &HeaderMap,
        body: Option<&[u8]>,
        extracted: &mut HashMap<String, String>,
        failed: &mut HashMap<String, String>,
    ) {
        let body = body.unwrap_or(&[]);
        for conf in &self.captures {
            match extract::extract(headers, body, conf) {
                Ok(value) => {
                    extracted.insert(conf.name.clone(), value);
                }
                Err(err) => {
                    extracted.insert(conf.name.clone(), String::new());
                    failed.insert(conf.name.clone(), err.to_string());
                }
            }
        }
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

fn server_reported(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(SERVER_TIME_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).to_string(),
            )
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn build_request(
    prepared: &Prepared,
    url: &Url,
    method: &Method,
    body: &Bytes,
    absolute_form: bool,
    is_h2: bool,
    host_override: Option<&str>,
) -> Result<Request<Full<Bytes>>, String> {
    // HTTP/2 derives its pseudo-headers from an absolute URI; plain HTTP
    // through a proxy travels in absolute form; everything else uses
    // origin form.
    let target = if is_h2 || absolute_form {
        url.as_str()
    } else {
        &url[Position::BeforePath..]
    };
    let uri: http::Uri = target
        .parse()
        .map_err(|e| format!("invalid request uri {target}: {e}"))?;

    let mut req = Request::builder()
        .method(method.clone())
        .uri(uri)
        .body(Full::new(body.clone()))
        .map_err(|e| e.to_string())?;
    *req.headers_mut() = prepared.headers.clone();

    let host_value = match host_override {
        Some(host) => host.to_string(),
        None => {
            let host = url.host_str().unwrap_or_default();
            match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            }
        }
    };
    req.headers_mut().insert(
        HOST,
        HeaderValue::from_str(&host_value).map_err(|e| format!("invalid host {host_value}: {e}"))?,
    );
    Ok(req)
}
