//! Scenario model: ordered HTTP steps, per-step options, capture rules,
//! and the preflight validation walk.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use http::Method;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use url::Url;

use crate::error::EngineError;
use crate::inject::ENV_RE;

/// Upper bound for inter-step sleeps, in milliseconds.
pub const MAX_SLEEP_MS: u64 = 90_000;

/// Methods the engine accepts.
pub const SUPPORTED_METHODS: &[Method] = &[
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
];

/// The only supported authentication scheme.
pub const AUTH_BASIC: &str = "basic";

/// An ordered multi-step scenario plus its initial environment.
#[derive(Debug, Clone, Default)]
pub struct Scenario {
    pub steps: Vec<ScenarioStep>,
    /// Seed environment, cloned into every iteration.
    pub envs: HashMap<String, String>,
}

impl Scenario {
    /// Validate step ids, methods, URLs, sleeps, capture configs, and the
    /// ordering of environment references (a step may only reference
    /// variables defined globally or captured by an earlier step).
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen_ids: HashSet<u16> = HashSet::with_capacity(self.steps.len());
        let mut defined: HashSet<String> = self.envs.keys().cloned().collect();

        for step in &self.steps {
            step.validate(&defined)?;

            for capture in &step.captures {
                defined.insert(capture.name.clone());
            }
            if !seen_ids.insert(step.id) {
                return Err(EngineError::validation(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }
        Ok(())
    }
}

/// One HTTP request within a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioStep {
    /// Client-provided id, unique within the scenario and greater than zero.
    pub id: u16,
    pub name: String,
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Already-staged request body (inline, file, or multipart).
    pub payload: Vec<u8>,
    /// Per-request network timeout, seconds.
    pub timeout_secs: u64,
    /// Pause after this step (never after the last step of a scenario).
    pub sleep: Sleep,
    pub auth: Option<BasicAuth>,
    /// Client certificate identity, when the step supplies one.
    pub tls_identity: Option<Arc<TlsIdentity>>,
    pub options: StepOptions,
    pub captures: Vec<CaptureConfig>,
}

impl ScenarioStep {
    fn validate(&self, defined: &HashSet<String>) -> Result<(), EngineError> {
        if self.id == 0 {
            return Err(EngineError::validation("step id must be greater than zero"));
        }
        if !SUPPORTED_METHODS.contains(&self.method) {
            return Err(EngineError::validation(format!(
                "step {}: unsupported method {}",
                self.id, self.method
            )));
        }
        if let Some(auth) = &self.auth {
            if auth.scheme != AUTH_BASIC {
                return Err(EngineError::validation(format!(
                    "step {}: unsupported auth type ({})",
                    self.id, auth.scheme
                )));
            }
        }
        validate_target(&self.url)
            .map_err(|m| EngineError::validation(format!("step {}: {m}", self.id)))?;

        for capture in &self.captures {
            capture
                .validate()
                .map_err(|m| EngineError::validation(format!("step {}: {m}", self.id)))?;
        }

        self.check_env_references(defined)
    }

    /// Every `{{name}}` referenced by the URL, headers, or payload must
    /// already be defined; order across steps matters.
    fn check_env_references(&self, defined: &HashSet<String>) -> Result<(), EngineError> {
        let check = |source: &str| -> Result<(), EngineError> {
            for m in ENV_RE.find_iter(source) {
                let name = &m.as_str()[2..m.as_str().len() - 2];
                if !defined.contains(name) {
                    return Err(EngineError::validation(format!(
                        "step {}: {} is not defined by global or captured environments",
                        self.id,
                        m.as_str()
                    )));
                }
            }
            Ok(())
        };

        check(&self.url)?;
        for (k, v) in &self.headers {
            check(k)?;
            check(v)?;
        }
        if let Ok(body) = std::str::from_utf8(&self.payload) {
            check(body)?;
        }
        Ok(())
    }
}

/// Accept the target when it parses as an absolute URL; placeholders are
/// allowed verbatim and checked at send time instead.
fn validate_target(target: &str) -> Result<(), String> {
    if ENV_RE.is_match(target) {
        return Ok(());
    }
    let url = Url::parse(target).map_err(|e| format!("target is not valid: {target} ({e})"))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("unsupported scheme {other}: {target}")),
    }
}

/// HTTP Basic credentials. Either field may carry placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicAuth {
    pub scheme: String,
    pub username: String,
    pub password: String,
}

/// Client TLS identity loaded at config time. The certificate file is also
/// parsed as a root pool during loading, mirroring the transport setup the
/// identity came from.
#[derive(Debug)]
pub struct TlsIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Recognized per-step connection options (from the opaque `others` map).
#[derive(Debug, Clone)]
pub struct StepOptions {
    pub disable_redirect: bool,
    pub keep_alive: bool,
    pub disable_compression: bool,
    pub h2: bool,
    /// SNI override.
    pub hostname: Option<String>,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            disable_redirect: false,
            keep_alive: true,
            disable_compression: false,
            h2: false,
            hostname: None,
        }
    }
}

/// Inter-step pause: none, a fixed duration, or a uniformly random
/// duration between two bounds (all milliseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sleep {
    #[default]
    None,
    Fixed(u64),
    Range(u64, u64),
}

impl Sleep {
    /// Parse `"" | "N" | "A-B"`, enforcing the 90 000 ms cap.
    /// Whitespace is expected to be stripped by the config layer.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        if raw.is_empty() {
            return Ok(Self::None);
        }
        let parts: Vec<&str> = raw.split('-').collect();
        if parts.len() > 2 {
            return Err(EngineError::validation(format!(
                "sleep expression is not valid: {raw}"
            )));
        }
        let mut bounds = Vec::with_capacity(2);
        for part in &parts {
            let ms: u64 = part.parse().map_err(|_| {
                EngineError::validation(format!("sleep duration is not valid: {raw}"))
            })?;
            if ms > MAX_SLEEP_MS {
                return Err(EngineError::validation(format!(
                    "sleep limit exceeded: got {ms} ms, max {MAX_SLEEP_MS} ms"
                )));
            }
            bounds.push(ms);
        }
        Ok(match bounds.as_slice() {
            [single] => Self::Fixed(*single),
            [a, b] => Self::Range(*a.min(b), *a.max(b)),
            _ => unreachable!("split produced 1 or 2 parts"),
        })
    }
}

/// Where a capture reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    Header,
    Body,
}

/// A regex capture: pattern plus the occurrence index to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegexCapture {
    pub pattern: String,
    pub match_index: usize,
}

/// A rule binding part of a response into the environment under `name`.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub name: String,
    pub from: CaptureSource,
    pub header_key: Option<String>,
    pub json_path: Option<String>,
    pub xpath: Option<String>,
    pub regex: Option<RegexCapture>,
}

impl CaptureConfig {
    fn validate(&self) -> Result<(), String> {
        match self.from {
            CaptureSource::Header => {
                if self.header_key.is_none() {
                    return Err(format!("capture {}: header key must be provided", self.name));
                }
            }
            CaptureSource::Body => {
                if self.json_path.is_none() && self.regex.is_none() && self.xpath.is_none() {
                    return Err(format!(
                        "capture {}: one of jsonPath, regExp or xPath must be provided",
                        self.name
                    ));
                }
            }
        }
        if let Some(re) = &self.regex {
            regex::Regex::new(&re.pattern)
                .map_err(|e| format!("capture {}: invalid regex: {e}", self.name))?;
        }
        Ok(())
    }
}
