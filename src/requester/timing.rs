//! Write-once phase timing for a single request.
//!
//! A [`RequestTrace`] is created per send and shared with the connection's
//! instrumented stream. Hooks may fire more than once (reconnects, retried
//! writes, redirect hops); only the first observation of each phase is
//! kept. All writes go through one mutex per request.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::result::PhaseDurations;

#[derive(Debug, Default)]
struct TraceState {
    dns: Option<Duration>,
    connect: Option<Duration>,
    tls: Option<Duration>,
    request_write: Option<Duration>,
    server_wait: Option<Duration>,
    response_read: Option<Duration>,
    write_start: Option<Instant>,
    last_write: Option<Instant>,
    first_byte: Option<Instant>,
}

/// Phase recorder for one request. Clone-free; share via `Arc`.
#[derive(Debug, Default)]
pub struct RequestTrace {
    state: Mutex<TraceState>,
}

impl RequestTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dns(&self, elapsed: Duration) {
        let mut s = self.state.lock().expect("trace lock");
        s.dns.get_or_insert(elapsed);
    }

    pub fn set_connect(&self, elapsed: Duration) {
        let mut s = self.state.lock().expect("trace lock");
        s.connect.get_or_insert(elapsed);
    }

    pub fn set_tls(&self, elapsed: Duration) {
        let mut s = self.state.lock().expect("trace lock");
        s.tls.get_or_insert(elapsed);
    }

    pub fn set_server_wait(&self, elapsed: Duration) {
        let mut s = self.state.lock().expect("trace lock");
        s.server_wait.get_or_insert(elapsed);
    }

    pub fn set_response_read(&self, elapsed: Duration) {
        let mut s = self.state.lock().expect("trace lock");
        s.response_read.get_or_insert(elapsed);
    }

    /// Stream hook: some bytes of the request were written.
    pub fn on_write(&self) {
        let now = Instant::now();
        let mut s = self.state.lock().expect("trace lock");
        if s.first_byte.is_some() {
            // Writes after the first response byte belong to a later
            // exchange on a reused connection.
            return;
        }
        s.write_start.get_or_insert(now);
        s.last_write = Some(now);
    }

    /// Stream hook: the first response bytes arrived. Closes the
    /// request-write window and opens the read window.
    pub fn on_read(&self) {
        let now = Instant::now();
        let mut s = self.state.lock().expect("trace lock");
        if s.first_byte.is_some() {
            return;
        }
        s.first_byte = Some(now);
        if let (Some(start), Some(last)) = (s.write_start, s.last_write) {
            s.request_write.get_or_insert(last.duration_since(start));
            s.server_wait.get_or_insert(now.duration_since(last));
        }
    }

    /// The response body has been fully consumed. No-op when no response
    /// byte was ever observed at the stream level.
    pub fn finish_read(&self) {
        let now = Instant::now();
        let mut s = self.state.lock().expect("trace lock");
        if let Some(first) = s.first_byte {
            s.response_read.get_or_insert(now.duration_since(first));
        }
    }

    /// Freeze the recorded phases. `https` controls whether a TLS entry is
    /// part of this request's metric set at all.
    pub fn snapshot(&self, https: bool) -> PhaseDurations {
        let s = self.state.lock().expect("trace lock");
        PhaseDurations {
            dns: s.dns.unwrap_or_default(),
            connect: s.connect.unwrap_or_default(),
            tls: https.then(|| s.tls.unwrap_or_default()),
            request_write: s.request_write.unwrap_or_default(),
            server_wait: s.server_wait.unwrap_or_default(),
            response_read: s.response_read.unwrap_or_default(),
            server_reported: None,
        }
    }
}

/// The slot an instrumented stream reads its active trace from.
///
/// A pooled connection outlives many requests; before each send the
/// requester installs that request's trace here and the stream hooks
/// forward to it.
#[derive(Debug, Clone, Default)]
pub struct TraceSlot {
    active: Arc<Mutex<Option<Arc<RequestTrace>>>>,
}

impl TraceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, trace: Arc<RequestTrace>) {
        *self.active.lock().expect("trace slot lock") = Some(trace);
    }

    pub fn clear(&self) {
        *self.active.lock().expect("trace slot lock") = None;
    }

    pub fn on_write(&self) {
        if let Some(trace) = self.active.lock().expect("trace slot lock").as_ref() {
            trace.on_write();
        }
    }

    pub fn on_read(&self) {
        if let Some(trace) = self.active.lock().expect("trace slot lock").as_ref() {
            trace.on_read();
        }
    }
}
