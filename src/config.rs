//! JSON test-plan loading.
//!
//! Parses the plan document field-for-field, applies defaults, stages
//! payloads (inline string, file, or multipart with remote parts fetched
//! synchronously), loads TLS identities, and produces a [`LoadPlan`].
//! Staging happens before the async runtime starts, so blocking I/O here
//! is deliberate.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use url::Url;
use uuid::Uuid;

use crate::error::EngineError;
use crate::plan::{
    LoadPlan, LoadShape, ProgramEntry, DEFAULT_DURATION_SECS, DEFAULT_ITERATIONS, DEFAULT_OUTPUT,
    DEFAULT_TIMEOUT_SECS,
};
use crate::scenario::{
    BasicAuth, CaptureConfig, CaptureSource, RegexCapture, Scenario, ScenarioStep, Sleep,
    StepOptions, TlsIdentity, AUTH_BASIC,
};

/// Top-level plan document.
#[derive(Debug, Deserialize)]
struct PlanFile {
    /// Legacy alias for `iteration_count`.
    #[serde(default)]
    request_count: Option<u64>,
    #[serde(default)]
    iteration_count: Option<u64>,
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default)]
    load_type: Option<String>,
    #[serde(default)]
    manual_load: Vec<ManualEntry>,
    #[serde(default)]
    proxy: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    env: HashMap<String, JsonValue>,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    steps: Vec<StepFile>,
}

#[derive(Debug, Deserialize)]
struct ManualEntry {
    duration: u64,
    count: u64,
}

#[derive(Debug, Deserialize)]
struct StepFile {
    id: u16,
    #[serde(default)]
    name: String,
    url: String,
    #[serde(default)]
    auth: Option<AuthFile>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    payload_file: String,
    #[serde(default)]
    payload_multipart: Vec<MultipartPart>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    sleep: String,
    #[serde(default)]
    others: HashMap<String, JsonValue>,
    #[serde(default)]
    cert_path: String,
    #[serde(default)]
    cert_key_path: String,
    #[serde(default, rename = "captureEnv")]
    capture_env: HashMap<String, CapturePath>,
}

#[derive(Debug, Deserialize)]
struct AuthFile {
    #[serde(default, rename = "type")]
    scheme: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
struct MultipartPart {
    name: String,
    #[serde(default)]
    value: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    src: String,
}

#[derive(Debug, Deserialize)]
struct CapturePath {
    #[serde(default, rename = "jsonPath")]
    json_path: Option<String>,
    #[serde(default, rename = "xPath")]
    x_path: Option<String>,
    #[serde(default, rename = "regExp")]
    reg_exp: Option<RegexFile>,
    from: String,
    #[serde(default, rename = "headerKey")]
    header_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegexFile {
    exp: String,
    #[serde(default, rename = "matchNo")]
    match_no: usize,
}

/// Load and stage a plan from a file path.
pub fn load_plan(path: &Path) -> Result<LoadPlan, EngineError> {
    let content = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigIo {
        source,
        path: path.display().to_string(),
    })?;
    parse_plan(&content)
}

/// Parse and stage a plan from a JSON string.
pub fn parse_plan(json: &str) -> Result<LoadPlan, EngineError> {
    let file: PlanFile = serde_json::from_str(json)?;
    file.into_plan()
}

impl PlanFile {
    fn into_plan(self) -> Result<LoadPlan, EngineError> {
        let mut steps = Vec::with_capacity(self.steps.len());
        for step in self.steps {
            steps.push(step.into_step()?);
        }

        let proxy = match self.proxy.as_deref().filter(|p| !p.is_empty()) {
            Some(raw) => Some(Url::parse(raw).map_err(|e| {
                EngineError::validation(format!("proxy is not a valid url: {raw} ({e})"))
            })?),
            None => None,
        };

        let envs = self
            .env
            .into_iter()
            .map(|(k, v)| (k, json_to_env_string(v)))
            .collect();

        // Back-compat: `request_count` feeds the iteration count.
        let iteration_count = self
            .iteration_count
            .or(self.request_count)
            .unwrap_or(DEFAULT_ITERATIONS);

        let shape = match self.load_type.as_deref() {
            Some(raw) => LoadShape::parse(raw)?,
            None => LoadShape::Linear,
        };

        let program: Vec<ProgramEntry> = self
            .manual_load
            .iter()
            .map(|entry| ProgramEntry {
                duration_secs: entry.duration,
                count: entry.count,
            })
            .collect();

        Ok(LoadPlan {
            iteration_count,
            duration_secs: self.duration.unwrap_or(DEFAULT_DURATION_SECS),
            shape,
            program,
            scenario: Scenario { steps, envs },
            proxy,
            output: self.output.unwrap_or_else(|| DEFAULT_OUTPUT.to_string()),
            debug: self.debug,
        })
    }
}

fn json_to_env_string(value: JsonValue) -> String {
    match value {
        JsonValue::String(s) => s,
        other => other.to_string(),
    }
}

impl StepFile {
    fn into_step(self) -> Result<ScenarioStep, EngineError> {
        let (payload, multipart_content_type) = self.stage_payload()?;

        let mut headers: Vec<(String, String)> = self.headers.into_iter().collect();
        headers.sort();
        if let Some(content_type) = multipart_content_type {
            headers.push(("Content-Type".to_string(), content_type));
        }

        let method = self.method.as_deref().unwrap_or("GET");
        let method = http::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                EngineError::validation(format!("step {}: invalid method {method}", self.id))
            })?;

        let auth = self.auth.map(|a| BasicAuth {
            scheme: if a.scheme.is_empty() {
                AUTH_BASIC.to_string()
            } else {
                a.scheme
            },
            username: a.username,
            password: a.password,
        });

        let sleep = Sleep::parse(&self.sleep.replace(' ', ""))?;
        let options = step_options(&self.others);

        let mut captures: Vec<CaptureConfig> = self
            .capture_env
            .into_iter()
            .map(|(name, path)| {
                let from = match path.from.as_str() {
                    "header" => Ok(CaptureSource::Header),
                    "body" => Ok(CaptureSource::Body),
                    other => Err(EngineError::validation(format!(
                        "capture {name}: invalid \"from\" source: {other}"
                    ))),
                }?;
                Ok(CaptureConfig {
                    name,
                    from,
                    header_key: path.header_key,
                    json_path: path.json_path,
                    xpath: path.x_path,
                    regex: path.reg_exp.map(|re| RegexCapture {
                        pattern: re.exp,
                        match_index: re.match_no,
                    }),
                })
            })
            .collect::<Result<_, EngineError>>()?;
        captures.sort_by(|a, b| a.name.cmp(&b.name));

        let tls_identity = if !self.cert_path.is_empty() && !self.cert_key_path.is_empty() {
            Some(load_identity(&self.cert_path, &self.cert_key_path)?)
        } else {
            None
        };

        Ok(ScenarioStep {
            id: self.id,
            name: self.name,
            method,
            url: self.url,
            headers,
            payload,
            timeout_secs: self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
            sleep,
            auth,
            tls_identity,
            options,
            captures,
        })
    }

    /// Exactly one of multipart, file, or inline payload is used, in that
    /// precedence order. Returns the staged bytes and, for multipart, the
    /// content type to attach.
    fn stage_payload(&self) -> Result<(Vec<u8>, Option<String>), EngineError> {
        if !self.payload_multipart.is_empty() {
            let (body, content_type) = build_multipart(self.id, &self.payload_multipart)?;
            return Ok((body, Some(content_type)));
        }
        if !self.payload_file.is_empty() {
            let bytes =
                std::fs::read(&self.payload_file).map_err(|e| EngineError::PayloadStaging {
                    step_id: self.id,
                    message: format!("cannot read {}: {e}", self.payload_file),
                })?;
            return Ok((bytes, None));
        }
        Ok((self.payload.clone().into_bytes(), None))
    }
}

fn step_options(others: &HashMap<String, JsonValue>) -> StepOptions {
    let mut options = StepOptions::default();
    if let Some(v) = others.get("disable-redirect").and_then(JsonValue::as_bool) {
        options.disable_redirect = v;
    }
    if let Some(v) = others.get("keep-alive").and_then(JsonValue::as_bool) {
        options.keep_alive = v;
    }
    if let Some(v) = others.get("disable-compression").and_then(JsonValue::as_bool) {
        options.disable_compression = v;
    }
    if let Some(v) = others.get("h2").and_then(JsonValue::as_bool) {
        options.h2 = v;
    }
    if let Some(v) = others.get("hostname").and_then(JsonValue::as_str) {
        options.hostname = Some(v.to_string());
    }
    options
}

/// Build a multipart/form-data body. `type:"file", src:"remote"` parts are
/// fetched with a synchronous GET at load time; other file parts are read
/// from disk; everything else is written as a form field.
fn build_multipart(
    step_id: u16,
    parts: &[MultipartPart],
) -> Result<(Vec<u8>, String), EngineError> {
    let boundary = format!("volley-{}", Uuid::new_v4().simple());
    let mut body: Vec<u8> = Vec::new();

    for part in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        if part.kind.eq_ignore_ascii_case("file") {
            let (filename, content) = if part.src.eq_ignore_ascii_case("remote") {
                let content = fetch_remote_part(step_id, &part.value)?;
                (remote_filename(&part.value, &part.name), content)
            } else {
                let content =
                    std::fs::read(&part.value).map_err(|e| EngineError::PayloadStaging {
                        step_id,
                        message: format!("cannot read multipart file {}: {e}", part.value),
                    })?;
                let filename = Path::new(&part.value)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| part.name.clone());
                (filename, content)
            };
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    part.name, filename
                )
                .as_bytes(),
            );
            body.extend_from_slice(&content);
            body.extend_from_slice(b"\r\n");
        } else {
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    part.name, part.value
                )
                .as_bytes(),
            );
        }
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    Ok((body, format!("multipart/form-data; boundary={boundary}")))
}

fn fetch_remote_part(step_id: u16, url: &str) -> Result<Vec<u8>, EngineError> {
    let response = reqwest::blocking::get(url).map_err(|e| EngineError::PayloadStaging {
        step_id,
        message: format!("cannot fetch {url}: {e}"),
    })?;
    if !response.status().is_success() {
        return Err(EngineError::PayloadStaging {
            step_id,
            message: format!("cannot fetch {url}: status {}", response.status()),
        });
    }
    let bytes = response.bytes().map_err(|e| EngineError::PayloadStaging {
        step_id,
        message: format!("cannot fetch {url}: {e}"),
    })?;
    Ok(bytes.to_vec())
}

fn remote_filename(url: &str, fallback: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(|s| s.to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Load a client identity; the certificate file doubles as a root pool,
/// which is parsed here so malformed PEM fails at load time.
fn load_identity(cert_path: &str, key_path: &str) -> Result<Arc<TlsIdentity>, EngineError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| EngineError::TlsIdentity {
        path: cert_path.to_string(),
        message: e.to_string(),
    })?;
    let mut reader = cert_pem.as_slice();
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| EngineError::TlsIdentity {
            path: cert_path.to_string(),
            message: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(EngineError::TlsIdentity {
            path: cert_path.to_string(),
            message: "no certificates found".to_string(),
        });
    }

    let mut roots = rustls::RootCertStore::empty();
    for cert in &certs {
        let _ = roots.add(cert.clone());
    }

    let key_pem = std::fs::read(key_path).map_err(|e| EngineError::TlsIdentity {
        path: key_path.to_string(),
        message: e.to_string(),
    })?;
    let mut reader = key_pem.as_slice();
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| EngineError::TlsIdentity {
            path: key_path.to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| EngineError::TlsIdentity {
            path: key_path.to_string(),
            message: "no private key found".to_string(),
        })?;

    Ok(Arc::new(TlsIdentity { certs, key }))
}
