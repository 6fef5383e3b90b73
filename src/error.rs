//! Error types for the load-generation engine.
//!
//! [`EngineError`] covers configuration loading, plan validation, and
//! engine lifecycle failures. [`RequestError`] is the per-request error
//! carried inside step results, classified into [`ErrorKind`] categories
//! that drive the engine's retry and shutdown decisions.

/// Errors raised before or around a test run: config parsing, payload
/// staging, plan validation, and engine setup.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The plan file could not be read from disk.
    #[error("failed to read plan file '{path}': {source}")]
    ConfigIo {
        source: std::io::Error,
        path: String,
    },

    /// The plan file is not valid JSON or does not match the schema.
    #[error("failed to parse plan: {source}")]
    ConfigParse {
        #[from]
        source: serde_json::Error,
    },

    /// Payload staging failed (payload file read, multipart part fetch).
    #[error("failed to stage payload for step {step_id}: {message}")]
    PayloadStaging { step_id: u16, message: String },

    /// TLS identity material could not be loaded.
    #[error("failed to load TLS identity '{path}': {message}")]
    TlsIdentity { path: String, message: String },

    /// Semantic validation failure, with the offending field named.
    #[error("plan validation error: {message}")]
    Validation { message: String },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Error categories for a single request.
///
/// `Proxy` triggers rotate-and-retry in the engine, `Intended` triggers a
/// silent worker exit; everything else is recorded in the step result and
/// the scenario continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Proxy,
    Connection,
    Dns,
    Parse,
    Address,
    InvalidRequest,
    Intended,
    Unknown,
}

impl ErrorKind {
    /// Static label used in histograms and debug output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Connection => "connection",
            Self::Dns => "dns",
            Self::Parse => "parse",
            Self::Address => "address",
            Self::InvalidRequest => "invalid-request",
            Self::Intended => "intended",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason strings shared between the classifier and the aggregated
/// error-distribution keys.
pub mod reason {
    pub const PROXY_REFUSED: &str = "proxy connection refused";
    pub const PROXY_TIMEOUT: &str = "proxy timeout";
    pub const CONN_TIMEOUT: &str = "connection timeout";
    pub const READ_TIMEOUT: &str = "read timeout";
    pub const CONN_REFUSED: &str = "connection refused";
    pub const CANCELED: &str = "context canceled";
}

/// Per-request error: a coarse [`ErrorKind`] plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub reason: String,
}

impl RequestError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    /// A request that could not be prepared (substitution failure, bad
    /// URL, malformed header).
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::InvalidRequest,
            format!("failed to prepare request: {}", reason.into()),
        )
    }

    /// An intentionally cancelled request.
    pub fn canceled() -> Self {
        Self::new(ErrorKind::Intended, reason::CANCELED)
    }

    /// Classify a transport-layer error by its message text.
    ///
    /// The markers follow the wording our dial and exchange paths produce
    /// (proxy dial failures are prefixed with `proxyconnect`, timeouts
    /// surface the tokio "deadline has elapsed" text).
    pub fn classify_transport(text: &str) -> Self {
        let msg = text.to_ascii_lowercase();
        if msg.contains("proxyconnect") {
            if msg.contains("connection refused") {
                return Self::new(ErrorKind::Proxy, reason::PROXY_REFUSED);
            }
            if msg.contains("deadline has elapsed") || msg.contains("timed out") {
                return Self::new(ErrorKind::Proxy, reason::PROXY_TIMEOUT);
            }
            return Self::new(ErrorKind::Proxy, text);
        }
        if msg.contains("deadline has elapsed") {
            return Self::new(ErrorKind::Connection, reason::CONN_TIMEOUT);
        }
        if msg.contains("i/o timeout") {
            return Self::new(ErrorKind::Connection, reason::READ_TIMEOUT);
        }
        if msg.contains("connection refused") {
            return Self::new(ErrorKind::Connection, reason::CONN_REFUSED);
        }
        if msg.contains("operation canceled") || msg.contains("context canceled") {
            return Self::canceled();
        }
        if msg.contains("connection reset by peer") {
            return Self::new(ErrorKind::Connection, "connection reset by peer");
        }
        Self::new(ErrorKind::Connection, text)
    }

    /// `true` for the kinds that terminate the scenario early.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ErrorKind::Proxy | ErrorKind::Intended)
    }
}

/// A capture that could not be extracted from a response.
///
/// Capture errors never fail a step; they populate the step result's
/// failed-captures map instead.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CaptureError {
    pub message: String,
}

impl CaptureError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
