//! Proxy selection.
//!
//! The engine only consumes the [`ProxyPool`] interface: hand out the
//! next proxy, accept a failure report in exchange for a replacement, and
//! annotate results. Strategies are selected by a compile-time tag.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use url::Url;

use crate::error::EngineError;

/// Abstraction over proxy rotation strategies.
///
/// `None` everywhere means "direct connection, no proxy".
pub trait ProxyPool: Send + Sync {
    /// All proxies this pool can hand out (used to pre-build requesters).
    fn all(&self) -> Vec<Option<Url>>;

    /// The proxy a new worker should use.
    fn next(&self) -> Option<Url>;

    /// Report a failing proxy; returns the replacement to retry with.
    fn report_failure(&self, addr: Option<&Url>, reason: &str) -> Option<Url>;

    /// Geo annotation for result metadata.
    fn country(&self, _addr: Option<&Url>) -> String {
        "unknown".to_string()
    }

    /// Called once when the test completes.
    fn done(&self) {}
}

/// Supported rotation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyStrategy {
    #[default]
    Single,
    RoundRobin,
}

impl ProxyStrategy {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw {
            "single" => Ok(Self::Single),
            "round-robin" => Ok(Self::RoundRobin),
            other => Err(EngineError::validation(format!(
                "unsupported proxy strategy: {other}"
            ))),
        }
    }
}

/// Build a pool for the given strategy and address list.
pub fn new_pool(strategy: ProxyStrategy, addrs: Vec<Url>) -> Arc<dyn ProxyPool> {
    match strategy {
        ProxyStrategy::Single => Arc::new(SingleProxy {
            addr: addrs.into_iter().next(),
        }),
        ProxyStrategy::RoundRobin => Arc::new(RoundRobinProxy {
            addrs,
            cursor: AtomicUsize::new(0),
        }),
    }
}

/// One fixed proxy (or none at all). Failure reports hand back the same
/// address; there is nothing to rotate to.
pub struct SingleProxy {
    addr: Option<Url>,
}

impl ProxyPool for SingleProxy {
    fn all(&self) -> Vec<Option<Url>> {
        vec![self.addr.clone()]
    }

    fn next(&self) -> Option<Url> {
        self.addr.clone()
    }

    fn report_failure(&self, _addr: Option<&Url>, reason: &str) -> Option<Url> {
        tracing::debug!(reason, "proxy failure reported to single-proxy pool");
        self.addr.clone()
    }
}

/// Rotates through a fixed list; a failure report advances the cursor.
pub struct RoundRobinProxy {
    addrs: Vec<Url>,
    cursor: AtomicUsize,
}

impl ProxyPool for RoundRobinProxy {
    fn all(&self) -> Vec<Option<Url>> {
        if self.addrs.is_empty() {
            vec![None]
        } else {
            self.addrs.iter().cloned().map(Some).collect()
        }
    }

    fn next(&self) -> Option<Url> {
        if self.addrs.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(self.addrs[i % self.addrs.len()].clone())
    }

    fn report_failure(&self, addr: Option<&Url>, reason: &str) -> Option<Url> {
        tracing::debug!(?addr, reason, "rotating away from failing proxy");
        self.next()
    }
}
