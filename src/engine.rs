//! The driver: turns the tick schedule into worker launches and owns the
//! test lifecycle.
//!
//! Workers are spawned on a [`TaskTracker`] and coordinated through one
//! [`CancellationToken`]. Results flow through a bounded mpsc channel
//! into the aggregator task; live snapshots come back through a watch
//! channel. Shutdown runs in a fixed order: stop ticking, join workers
//! (capped), close the channel, wait for the aggregator (capped), then
//! release requesters and the proxy pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{EngineError, ErrorKind};
use crate::plan::LoadPlan;
use crate::proxy::ProxyPool;
use crate::report::{self, AggregateSummary};
use crate::result::ScenarioResult;
use crate::runner::ScenarioRunner;
use crate::schedule;

/// Attempts per iteration when proxies keep failing.
const MAX_PROXY_ATTEMPTS: u32 = 3;

/// Cap on waiting for workers and for the aggregator during shutdown.
/// Exceeding it is a warning, not an error.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Load-test engine. Create with a validated plan, then [`Engine::run`].
pub struct Engine {
    plan: LoadPlan,
    pool: Arc<dyn ProxyPool>,
    runner: Arc<ScenarioRunner>,
    cancel: CancellationToken,
    snapshot_tx: watch::Sender<AggregateSummary>,
}

impl Engine {
    /// Validate the plan and assemble the engine. The returned watch
    /// receiver delivers aggregate snapshots for live progress surfaces.
    pub fn new(
        plan: LoadPlan,
        pool: Arc<dyn ProxyPool>,
        cancel: CancellationToken,
    ) -> Result<(Self, watch::Receiver<AggregateSummary>), EngineError> {
        plan.validate()?;
        let runner = Arc::new(ScenarioRunner::new(
            plan.scenario.clone(),
            cancel.clone(),
            plan.debug,
        ));
        let (snapshot_tx, snapshot_rx) = watch::channel(AggregateSummary::default());
        Ok((
            Self {
                plan,
                pool,
                runner,
                cancel,
                snapshot_tx,
            },
            snapshot_rx,
        ))
    }

    /// Run the test to completion and return the final aggregate state.
    pub async fn run(self) -> Result<AggregateSummary, EngineError> {
        let Self {
            plan,
            pool,
            runner,
            cancel,
            snapshot_tx,
        } = self;

        // Surface requester construction errors before the first tick.
        runner.prewarm(&pool.all()).await?;

        let ticks = schedule::build(&plan);
        let capacity = (plan.effective_iterations() as usize * 2).max(1);
        let (result_tx, result_rx) = mpsc::channel::<ScenarioResult>(capacity);

        let mut final_snapshot_rx = snapshot_tx.subscribe();
        let aggregator = tokio::spawn(report::run_aggregator(result_rx, snapshot_tx, plan.debug));

        let tracker = TaskTracker::new();
        let started = Instant::now();
        let deadline = tokio::time::sleep(Duration::from_secs(plan.effective_duration_secs()));
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(schedule::TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick_index = 0usize;

        tracing::info!(
            iterations = plan.effective_iterations(),
            duration_secs = plan.effective_duration_secs(),
            ticks = ticks.len(),
            "starting load test"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("cancellation received, stopping driver");
                    break;
                }
                _ = &mut deadline => {
                    tracing::info!("test duration elapsed, stopping driver");
                    break;
                }
                _ = ticker.tick() => {
                    if tick_index >= ticks.len() {
                        break;
                    }
                    for _ in 0..ticks[tick_index] {
                        tracker.spawn(worker(
                            runner.clone(),
                            pool.clone(),
                            cancel.clone(),
                            result_tx.clone(),
                        ));
                    }
                    tick_index += 1;
                }
            }
        }

        // Let in-flight workers finish, bounded.
        tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("some workers did not finish within {SHUTDOWN_TIMEOUT:?}");
        }

        // Close the result channel and drain the aggregator, bounded.
        drop(result_tx);
        let state = match tokio::time::timeout(SHUTDOWN_TIMEOUT, aggregator).await {
            Ok(Ok(state)) => state,
            Ok(Err(join_err)) => {
                tracing::warn!(%join_err, "aggregator task failed");
                final_snapshot_rx.borrow_and_update().clone()
            }
            Err(_) => {
                tracing::warn!("aggregator did not finish within {SHUTDOWN_TIMEOUT:?}");
                final_snapshot_rx.borrow_and_update().clone()
            }
        };

        runner.shutdown().await;
        pool.done();

        tracing::info!(
            success = state.success_count,
            failed = state.failed_count,
            elapsed = ?started.elapsed(),
            "load test finished"
        );
        Ok(state)
    }
}

/// One scenario iteration: take a proxy, run the scenario, rotate on
/// proxy failures (3 attempts), stay silent on cancellation, and emit the
/// result.
async fn worker(
    runner: Arc<ScenarioRunner>,
    pool: Arc<dyn ProxyPool>,
    cancel: CancellationToken,
    result_tx: mpsc::Sender<ScenarioResult>,
) {
    if cancel.is_cancelled() {
        return;
    }

    let started_at = Instant::now();
    let mut proxy = pool.next();
    let mut outcome = None;

    for _ in 0..MAX_PROXY_ATTEMPTS {
        if cancel.is_cancelled() {
            return;
        }
        let (result, terminal) = runner.run(proxy.clone(), started_at).await;
        match terminal {
            None => {
                outcome = Some(result);
                break;
            }
            Some(err) if err.kind == ErrorKind::Proxy => {
                tracing::debug!(reason = %err.reason, "proxy failed, rotating");
                proxy = pool.report_failure(proxy.as_ref(), &err.reason);
            }
            Some(err) if err.kind == ErrorKind::Intended => return,
            Some(err) => {
                tracing::warn!(%err, "iteration dropped");
                return;
            }
        }
    }

    let Some(mut result) = outcome else {
        tracing::warn!("proxy retries exhausted, iteration dropped");
        return;
    };

    result
        .meta
        .insert("proxy_country".to_string(), pool.country(result.proxy.as_ref()));

    tokio::select! {
        sent = result_tx.send(result) => {
            if sent.is_err() {
                tracing::warn!("result channel closed before emit");
            }
        }
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{LoadPlan, LoadShape};
    use crate::proxy::{new_pool, ProxyStrategy};
    use crate::scenario::{Scenario, ScenarioStep, Sleep, StepOptions};
    use http::Method;
    use std::collections::HashMap;

    fn plan(iterations: u64, duration: u64, url: &str) -> LoadPlan {
        LoadPlan {
            iteration_count: iterations,
            duration_secs: duration,
            shape: LoadShape::Linear,
            program: Vec::new(),
            scenario: Scenario {
                steps: vec![ScenarioStep {
                    id: 1,
                    name: "hit".to_string(),
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
                }],
                envs: HashMap::new(),
            },
            proxy: None,
            output: "stdout".to_string(),
            debug: false,
        }
    }

    #[tokio::test]
    async fn test_engine_rejects_invalid_plan() {
        let mut p = plan(1, 1, "http://127.0.0.1:1/");
        p.scenario.steps.clear();
        let pool = new_pool(ProxyStrategy::Single, Vec::new());
        assert!(Engine::new(p, pool, CancellationToken::new()).is_err());
    }

    #[tokio::test]
    async fn test_engine_counts_failures_against_closed_port() {
        // Every connection is refused: iterations complete as failures.
        let p = plan(3, 1, "http://127.0.0.1:1/");
        let pool = new_pool(ProxyStrategy::Single, Vec::new());
        let (engine, _rx) = Engine::new(p, pool, CancellationToken::new()).unwrap();
        let state = engine.run().await.unwrap();
        assert_eq!(state.success_count, 0);
        assert_eq!(state.failed_count, 3);
        assert_eq!(state.total_requests, 3);
    }

    #[tokio::test]
    async fn test_engine_cancelled_before_start_emits_nothing() {
        let p = plan(10, 5, "http://127.0.0.1:1/");
        let pool = new_pool(ProxyStrategy::Single, Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (engine, _rx) = Engine::new(p, pool, cancel).unwrap();

        let started = Instant::now();
        let state = engine.run().await.unwrap();
        assert_eq!(state.total_scenarios(), 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_engine_drops_iterations_when_proxy_keeps_failing() {
        // The single proxy is a closed port: every attempt fails with a
        // proxy-kind error, the worker rotates three times, then drops
        // the iteration without emitting a result.
        let mut p = plan(2, 1, "http://example.com/");
        p.proxy = Some(url::Url::parse("http://127.0.0.1:1").unwrap());
        let proxies = vec![p.proxy.clone().unwrap()];
        let pool = new_pool(ProxyStrategy::Single, proxies);
        let (engine, _rx) = Engine::new(p, pool, CancellationToken::new()).unwrap();
        let state = engine.run().await.unwrap();
        assert_eq!(state.total_scenarios(), 0);
        assert_eq!(state.total_requests, 0);
    }

    #[tokio::test]
    async fn test_engine_snapshot_receiver_sees_final_state() {
        let p = plan(2, 1, "http://127.0.0.1:1/");
        let pool = new_pool(ProxyStrategy::Single, Vec::new());
        let (engine, rx) = Engine::new(p, pool, CancellationToken::new()).unwrap();
        let state = engine.run().await.unwrap();
        assert_eq!(rx.borrow().total_scenarios(), state.total_scenarios());
    }
}
