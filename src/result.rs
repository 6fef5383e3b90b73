//! Per-iteration outcome types flowing from workers to the aggregator.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use url::Url;
use uuid::Uuid;

use crate::error::RequestError;

/// Wall-clock spent in each protocol phase of one request.
///
/// Phases that never happened stay zero: `dns`/`connect`/`tls` on a
/// reused connection, `tls` on plain HTTP. `tls` is `None` for non-HTTPS
/// targets so it never shows up in their metric set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseDurations {
    pub dns: Duration,
    pub connect: Duration,
    pub tls: Option<Duration>,
    pub request_write: Duration,
    pub server_wait: Duration,
    pub response_read: Duration,
    /// Server-side processing time reported via `x-server-response-time`.
    pub server_reported: Option<Duration>,
}

impl PhaseDurations {
    /// Sum of the measured phases (the reported server time is
    /// informational and excluded).
    pub fn total(&self) -> Duration {
        self.dns
            + self.connect
            + self.tls.unwrap_or_default()
            + self.request_write
            + self.server_wait
            + self.response_read
    }

    /// Named metric entries for aggregation, in a stable order.
    pub fn entries(&self) -> Vec<(&'static str, Duration)> {
        let mut out = vec![
            ("dns", self.dns),
            ("connect", self.connect),
            ("request_write", self.request_write),
            ("server_wait", self.server_wait),
            ("response_read", self.response_read),
        ];
        if let Some(tls) = self.tls {
            out.push(("tls", tls));
        }
        if let Some(reported) = self.server_reported {
            out.push(("server_reported", reported));
        }
        out
    }
}

/// Request/response dump captured in debug mode.
#[derive(Debug, Clone, Default)]
pub struct DebugDump {
    pub url: String,
    pub method: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: Vec<u8>,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Vec<u8>,
}

/// Outcome of a single step within one iteration.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_id: u16,
    pub step_name: String,
    /// Unique per request.
    pub request_id: Uuid,
    /// HTTP status, or 0 when the call never produced a response.
    pub status_code: u16,
    pub started_at: Instant,
    /// Sum of the measured phase durations.
    pub total_duration: Duration,
    /// Response Content-Length, or -1 when unknown.
    pub content_length: i64,
    pub error: Option<RequestError>,
    pub durations: PhaseDurations,
    /// Variables captured out of this step's response.
    pub extracted: HashMap<String, String>,
    /// Snapshot of the environment visible when the step was sent.
    pub usable: HashMap<String, String>,
    /// Capture names that failed, with the reason.
    pub failed_captures: HashMap<String, String>,
    pub debug: Option<DebugDump>,
}

impl StepResult {
    /// A step succeeded when it carries no error.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of one full scenario iteration.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub started_at: Instant,
    pub proxy: Option<Url>,
    pub steps: Vec<StepResult>,
    /// Engine annotations (e.g. proxy country).
    pub meta: HashMap<String, String>,
}

impl ScenarioResult {
    pub fn new(started_at: Instant, proxy: Option<Url>) -> Self {
        Self {
            started_at,
            proxy,
            steps: Vec::new(),
            meta: HashMap::new(),
        }
    }

    /// An iteration succeeded when every step did.
    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(StepResult::succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, RequestError};

    pub(crate) fn step_result(id: u16, error: Option<RequestError>) -> StepResult {
        StepResult {
            step_id: id,
            step_name: format!("step-{id}"),
            request_id: Uuid::new_v4(),
            status_code: if error.is_some() { 0 } else { 200 },
            started_at: Instant::now(),
            total_duration: Duration::from_millis(25),
            content_length: 12,
            error,
            durations: PhaseDurations::default(),
            extracted: HashMap::new(),
            usable: HashMap::new(),
            failed_captures: HashMap::new(),
            debug: None,
        }
    }

    #[test]
    fn test_total_sums_phases() {
        let d = PhaseDurations {
            dns: Duration::from_millis(3),
            connect: Duration::from_millis(7),
            tls: Some(Duration::from_millis(11)),
            request_write: Duration::from_millis(1),
            server_wait: Duration::from_millis(40),
            response_read: Duration::from_millis(2),
            server_reported: Some(Duration::from_millis(38)),
        };
        assert_eq!(d.total(), Duration::from_millis(64));
    }

    #[test]
    fn test_entries_omit_absent_phases() {
        let d = PhaseDurations::default();
        let names: Vec<&str> = d.entries().iter().map(|(n, _)| *n).collect();
        assert!(!names.contains(&"tls"));
        assert!(!names.contains(&"server_reported"));
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_entries_include_tls_and_reported() {
        let d = PhaseDurations {
            tls: Some(Duration::from_millis(5)),
            server_reported: Some(Duration::from_millis(9)),
            ..Default::default()
        };
        let names: Vec<&str> = d.entries().iter().map(|(n, _)| *n).collect();
        assert!(names.contains(&"tls"));
        assert!(names.contains(&"server_reported"));
    }

    #[test]
    fn test_scenario_success_requires_all_steps() {
        let mut res = ScenarioResult::new(Instant::now(), None);
        res.steps.push(step_result(1, None));
        res.steps.push(step_result(2, None));
        assert!(res.succeeded());

        res.steps.push(step_result(
            3,
            Some(RequestError::new(ErrorKind::Connection, "refused")),
        ));
        assert!(!res.succeeded());
    }
}
