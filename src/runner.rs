//! Scenario runner: executes the ordered step list for one iteration,
//! threading captured variables forward and sleeping between steps.
//!
//! Requesters are created lazily per proxy under a single mutex, so all
//! workers hitting the same proxy share one requester list (and its
//! connection pools).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{EngineError, ErrorKind, RequestError};
use crate::inject;
use crate::requester::HttpRequester;
use crate::result::ScenarioResult;
use crate::scenario::{Scenario, Sleep};

struct StepRunner {
    requester: HttpRequester,
    sleep: Sleep,
}

/// Runs scenario iterations. One instance serves the whole test.
pub struct ScenarioRunner {
    scenario: Scenario,
    cancel: CancellationToken,
    debug: bool,
    requesters: Mutex<HashMap<String, Arc<Vec<StepRunner>>>>,
}

impl ScenarioRunner {
    pub fn new(scenario: Scenario, cancel: CancellationToken, debug: bool) -> Self {
        Self {
            scenario,
            cancel,
            debug,
            requesters: Mutex::new(HashMap::new()),
        }
    }

    /// Eagerly build requesters for the given proxies so template errors
    /// surface before the first tick.
    pub async fn prewarm(&self, proxies: &[Option<Url>]) -> Result<(), EngineError> {
        for proxy in proxies {
            self.for_proxy(proxy).await?;
        }
        Ok(())
    }

    /// Run one iteration against `proxy`.
    ///
    /// The returned error is terminal only: `proxy` kind asks the engine
    /// to rotate and retry, `intended` means cancellation. All other step
    /// failures live inside the result and the iteration keeps going.
    pub async fn run(
        &self,
        proxy: Option<Url>,
        started_at: Instant,
    ) -> (ScenarioResult, Option<RequestError>) {
        let mut result = ScenarioResult::new(started_at, proxy.clone());

        let runners = match self.for_proxy(&proxy).await {
            Ok(r) => r,
            Err(e) => {
                return (
                    result,
                    Some(RequestError::new(ErrorKind::Unknown, e.to_string())),
                )
            }
        };

        let mut envs = self.seed_envs();
        let last = runners.len().saturating_sub(1);

        for (idx, runner) in runners.iter().enumerate() {
            let step_result = runner.requester.send(&envs).await;

            if let Some(err) = &step_result.error {
                if err.kind == ErrorKind::Intended {
                    return (result, Some(err.clone()));
                }
                if err.kind == ErrorKind::Proxy {
                    let err = err.clone();
                    result.steps.push(step_result);
                    return (result, Some(err));
                }
            }

            let extracted = step_result.extracted.clone();
            result.steps.push(step_result);
            envs.extend(extracted);

            if idx < last {
                self.pause(runner.sleep).await;
            }
        }
        (result, None)
    }

    /// Close every requester's idle connections.
    pub async fn shutdown(&self) {
        let requesters = self.requesters.lock().await;
        for runners in requesters.values() {
            for runner in runners.iter() {
                runner.requester.shutdown();
            }
        }
    }

    /// Fresh environment for one iteration: the scenario seed with dynamic
    /// placeholders resolved per iteration.
    fn seed_envs(&self) -> HashMap<String, String> {
        let mut envs = self.scenario.envs.clone();
        for value in envs.values_mut() {
            if inject::has_dynamic(value) {
                if let Ok(injected) = inject::inject_dynamic(value) {
                    *value = injected;
                }
            }
        }
        envs
    }

    async fn for_proxy(&self, proxy: &Option<Url>) -> Result<Arc<Vec<StepRunner>>, EngineError> {
        let key = proxy.as_ref().map(Url::as_str).unwrap_or("").to_string();
        let mut requesters = self.requesters.lock().await;
        if let Some(existing) = requesters.get(&key) {
            return Ok(existing.clone());
        }

        let mut runners = Vec::with_capacity(self.scenario.steps.len());
        for step in &self.scenario.steps {
            runners.push(StepRunner {
                requester: HttpRequester::new(
                    step,
                    proxy.clone(),
                    self.cancel.clone(),
                    self.debug,
                )?,
                sleep: step.sleep,
            });
        }
        let runners = Arc::new(runners);
        requesters.insert(key, runners.clone());
        Ok(runners)
    }

    async fn pause(&self, sleep: Sleep) {
        let ms = match sleep {
            Sleep::None => return,
            Sleep::Fixed(ms) => ms,
            Sleep::Range(min, max) => rand::rng().random_range(min..=max),
        };
        if ms == 0 {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{ScenarioStep, StepOptions};
    use http::Method;

    fn scenario(urls: &[&str]) -> Scenario {
        Scenario {
            steps: urls
                .iter()
                .enumerate()
                .map(|(i, url)| ScenarioStep {
                    id: (i + 1) as u16,
                    name: format!("step-{}", i + 1),
                    method: Method::GET,
                    url: url.to_string(),
                    headers: Vec::new(),
                    payload: Vec::new(),
                    timeout_secs: 1,
                    sleep: Sleep::None,
                    auth: None,
                    tls_identity: None,
                    options: StepOptions::default(),
                    captures: Vec::new(),
                })
                .collect(),
            envs: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_requesters_are_cached_per_proxy() {
        let runner = ScenarioRunner::new(
            scenario(&["http://example.com/"]),
            CancellationToken::new(),
            false,
        );
        let a = runner.for_proxy(&None).await.unwrap();
        let b = runner.for_proxy(&None).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let proxy = Some(Url::parse("http://proxy:3128").unwrap());
        let c = runner.for_proxy(&proxy).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_seed_envs_resolves_dynamic_values() {
        let mut s = scenario(&["http://example.com/"]);
        s.envs
            .insert("trace".to_string(), "run-{{_uuid}}".to_string());
        s.envs.insert("fixed".to_string(), "plain".to_string());
        let runner = ScenarioRunner::new(s, CancellationToken::new(), false);

        let envs = runner.seed_envs();
        assert_eq!(envs.get("fixed").map(String::as_str), Some("plain"));
        let trace = envs.get("trace").unwrap();
        assert!(trace.starts_with("run-"));
        assert!(!trace.contains("{{_uuid}}"));

        // Each iteration seeds independently.
        let again = runner.seed_envs();
        assert_ne!(again.get("trace"), envs.get("trace"));
    }

    #[tokio::test]
    async fn test_run_records_non_terminal_failures_and_continues() {
        // Both steps point at a closed port: connection errors are
        // recorded per step and the scenario runs to completion.
        let runner = ScenarioRunner::new(
            scenario(&["http://127.0.0.1:1/", "http://127.0.0.1:1/"]),
            CancellationToken::new(),
            false,
        );
        let (result, terminal) = runner.run(None, Instant::now()).await;
        assert!(terminal.is_none());
        assert_eq!(result.steps.len(), 2);
        assert!(!result.succeeded());
        for step in &result.steps {
            assert_eq!(step.error.as_ref().unwrap().kind, ErrorKind::Connection);
        }
    }

    #[tokio::test]
    async fn test_run_cancelled_returns_intended_without_step() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = ScenarioRunner::new(
            scenario(&["http://10.255.255.1:81/"]),
            cancel,
            false,
        );
        let (result, terminal) = runner.run(None, Instant::now()).await;
        assert_eq!(terminal.unwrap().kind, ErrorKind::Intended);
        assert!(result.steps.is_empty());
    }

    #[tokio::test]
    async fn test_run_returns_proxy_error_with_partial_result() {
        // Proxy dial fails with a proxyconnect marker: terminal for the
        // iteration, result keeps the failing step.
        let proxy = Some(Url::parse("http://127.0.0.1:1").unwrap());
        let runner = ScenarioRunner::new(
            scenario(&["http://example.com/", "http://example.com/b"]),
            CancellationToken::new(),
            false,
        );
        let (result, terminal) = runner.run(proxy, Instant::now()).await;
        assert_eq!(terminal.unwrap().kind, ErrorKind::Proxy);
        assert_eq!(result.steps.len(), 1);
    }
}
