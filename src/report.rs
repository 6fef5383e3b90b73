//! Result aggregation.
//!
//! A single task owns the [`AggregateSummary`] and consumes the result
//! channel, so no locking is needed around the counters. Snapshots are
//! published through a
//! watch channel every two seconds and once more when the channel closes;
//! the task finishing is the engine's "aggregation done" signal.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::result::ScenarioResult;
use crate::summary;

/// Success-count quantiles at which a progress point is recorded.
const PROGRESS_PERCENTAGES: [f64; 7] = [0.10, 0.25, 0.40, 0.50, 0.75, 0.90, 1.00];

/// Interval between snapshot publications.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(2);

/// Running statistics for one scenario step.
#[derive(Debug, Clone, Default)]
pub struct StepSummary {
    pub name: String,
    pub success_count: u64,
    pub fail_count: u64,
    pub status_codes: BTreeMap<u16, u64>,
    /// Failure reason histogram.
    pub errors: BTreeMap<String, u64>,
    /// Running mean per metric name, seconds.
    pub durations: BTreeMap<String, f64>,
}

impl StepSummary {
    fn new(name: String) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }
}

/// Live aggregate state for the whole test.
#[derive(Debug, Clone, Default)]
pub struct AggregateSummary {
    /// Scenarios where every step succeeded.
    pub success_count: u64,
    pub failed_count: u64,
    /// Running mean of scenario total duration, seconds.
    pub avg_duration: f64,
    pub steps: BTreeMap<u16, StepSummary>,
    /// Global running means per metric name, seconds.
    pub durations: BTreeMap<String, f64>,
    pub status_codes: BTreeMap<u16, u64>,
    pub total_requests: u64,
    /// Total number of metric entries seen across all step results.
    pub total_metric_count: u64,
    /// Scenario duration recorded when the success count first hit a
    /// quantile milestone, keyed by that count.
    pub progress_points: BTreeMap<u64, f64>,
}

impl AggregateSummary {
    /// Fold one iteration result into the running state.
    pub fn record(&mut self, result: &ScenarioResult) {
        let mut is_success = true;
        let mut scenario_duration = 0f64;

        for sr in &result.steps {
            let metrics = sr.durations.entries();
            self.total_metric_count += metrics.len() as u64;
            self.total_requests += 1;

            let step = self
                .steps
                .entry(sr.step_id)
                .or_insert_with(|| StepSummary::new(sr.step_name.clone()));

            if let Some(err) = &sr.error {
                is_success = false;
                step.fail_count += 1;
                *step.errors.entry(err.reason.clone()).or_default() += 1;
            } else {
                step.success_count += 1;
            }
            *step.status_codes.entry(sr.status_code).or_default() += 1;

            let step_total = sr.total_duration.as_secs_f64();
            let count = (step.success_count + step.fail_count) as f64;
            for &(name, value) in &metrics {
                fold_mean(&mut step.durations, name, value.as_secs_f64(), count);
            }
            fold_mean(&mut step.durations, "duration", step_total, count);

            // Global means are weighted by scenarios processed, counting
            // the one in flight.
            let global_count = (self.success_count + self.failed_count + 1) as f64;
            for &(name, value) in &metrics {
                fold_mean(&mut self.durations, name, value.as_secs_f64(), global_count);
            }
            fold_mean(&mut self.durations, "duration", step_total, global_count);

            *self.status_codes.entry(sr.status_code).or_default() += 1;
            scenario_duration += step_total;
        }

        if is_success {
            self.success_count += 1;
            for percent in PROGRESS_PERCENTAGES {
                let milestone = ((self.success_count as f64) * percent).ceil() as u64;
                if self.success_count == milestone {
                    self.progress_points.insert(milestone, scenario_duration);
                }
            }
        } else {
            self.failed_count += 1;
        }

        let scenarios = (self.success_count + self.failed_count) as f64;
        self.avg_duration =
            (self.avg_duration * (scenarios - 1.0) + scenario_duration) / scenarios;
    }

    pub fn total_scenarios(&self) -> u64 {
        self.success_count + self.failed_count
    }

    pub fn success_percentage(&self) -> u64 {
        if self.total_scenarios() == 0 {
            return 0;
        }
        (self.success_count as f64 / self.total_scenarios() as f64 * 100.0) as u64
    }

    pub fn failed_percentage(&self) -> u64 {
        if self.total_scenarios() == 0 {
            return 0;
        }
        100 - self.success_percentage()
    }
}

fn fold_mean(map: &mut BTreeMap<String, f64>, name: &str, sample: f64, count: f64) {
    let mean = map.entry(name.to_string()).or_default();
    *mean = (*mean * (count - 1.0) + sample) / count;
}

/// Consume the result channel until it closes, publishing snapshots along
/// the way. Returns the final state; in debug mode every result is dumped
/// verbosely as it arrives.
///
/// Uses `biased;` so snapshot ticks are not starved while the channel is
/// busy.
pub async fn run_aggregator(
    mut rx: mpsc::Receiver<ScenarioResult>,
    snapshot_tx: watch::Sender<AggregateSummary>,
    debug: bool,
) -> AggregateSummary {
    let mut state = AggregateSummary::default();
    let mut tick = tokio::time::interval(SNAPSHOT_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = tick.tick() => {
                while let Ok(result) = rx.try_recv() {
                    consume(&mut state, &result, debug);
                }
                let _ = snapshot_tx.send(state.clone());
            }
            received = rx.recv() => {
                match received {
                    Some(result) => consume(&mut state, &result, debug),
                    None => {
                        let _ = snapshot_tx.send(state.clone());
                        break;
                    }
                }
            }
        }
    }
    state
}

fn consume(state: &mut AggregateSummary, result: &ScenarioResult, debug: bool) {
    state.record(result);
    if debug {
        for step in &result.steps {
            println!("{}", summary::render_step_debug(step));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, RequestError};
    use crate::result::{PhaseDurations, ScenarioResult, StepResult};
    use std::collections::HashMap;
    use std::time::Instant;
    use uuid::Uuid;

    fn step_result(id: u16, millis: u64, error: Option<RequestError>) -> StepResult {
        StepResult {
            step_id: id,
            step_name: format!("step-{id}"),
            request_id: Uuid::new_v4(),
            status_code: if error.is_some() { 0 } else { 200 },
            started_at: Instant::now(),
            total_duration: Duration::from_millis(millis),
            content_length: 10,
            error,
            durations: PhaseDurations {
                server_wait: Duration::from_millis(millis),
                ..Default::default()
            },
            extracted: HashMap::new(),
            usable: HashMap::new(),
            failed_captures: HashMap::new(),
            debug: None,
        }
    }

    fn scenario_result(steps: Vec<StepResult>) -> ScenarioResult {
        let mut r = ScenarioResult::new(Instant::now(), None);
        r.steps = steps;
        r
    }

    #[test]
    fn test_success_requires_every_step() {
        let mut state = AggregateSummary::default();
        state.record(&scenario_result(vec![
            step_result(1, 100, None),
            step_result(2, 100, None),
        ]));
        assert_eq!(state.success_count, 1);
        assert_eq!(state.failed_count, 0);

        state.record(&scenario_result(vec![
            step_result(1, 100, None),
            step_result(2, 100, Some(RequestError::new(ErrorKind::Connection, "refused"))),
        ]));
        assert_eq!(state.success_count, 1);
        assert_eq!(state.failed_count, 1);
    }

    #[test]
    fn test_per_step_counters_and_histograms() {
        let mut state = AggregateSummary::default();
        state.record(&scenario_result(vec![step_result(1, 50, None)]));
        state.record(&scenario_result(vec![step_result(
            1,
            70,
            Some(RequestError::new(ErrorKind::Connection, "connection refused")),
        )]));

        let step = state.steps.get(&1).unwrap();
        assert_eq!(step.success_count, 1);
        assert_eq!(step.fail_count, 1);
        assert_eq!(step.status_codes.get(&200), Some(&1));
        assert_eq!(step.status_codes.get(&0), Some(&1));
        assert_eq!(step.errors.get("connection refused"), Some(&1));
        assert_eq!(state.total_requests, 2);
    }

    #[test]
    fn test_step_duration_running_mean() {
        let mut state = AggregateSummary::default();
        state.record(&scenario_result(vec![step_result(1, 100, None)]));
        state.record(&scenario_result(vec![step_result(1, 300, None)]));

        let step = state.steps.get(&1).unwrap();
        let mean = step.durations.get("duration").unwrap();
        assert!((mean - 0.2).abs() < 1e-9, "mean was {mean}");
    }

    #[test]
    fn test_avg_duration_over_scenarios() {
        let mut state = AggregateSummary::default();
        state.record(&scenario_result(vec![step_result(1, 1000, None)]));
        state.record(&scenario_result(vec![step_result(1, 3000, None)]));
        assert!((state.avg_duration - 2.0).abs() < 1e-9, "{}", state.avg_duration);
    }

    #[test]
    fn test_first_success_records_progress_point() {
        let mut state = AggregateSummary::default();
        state.record(&scenario_result(vec![step_result(1, 500, None)]));
        // Every quantile of a max of one is one.
        assert_eq!(state.progress_points.len(), 1);
        assert!(state.progress_points.contains_key(&1));
    }

    #[test]
    fn test_progress_points_accumulate_at_quantiles() {
        let mut state = AggregateSummary::default();
        for _ in 0..100 {
            state.record(&scenario_result(vec![step_result(1, 100, None)]));
        }
        assert_eq!(state.success_count, 100);
        // ceil(n * p) == n holds at n = 1 for every p, and again whenever
        // a later n is its own quantile; the map keeps them all.
        assert!(state.progress_points.contains_key(&1));
        assert!(state.progress_points.len() > 1);
    }

    #[test]
    fn test_failed_scenarios_do_not_move_progress() {
        let mut state = AggregateSummary::default();
        state.record(&scenario_result(vec![step_result(
            1,
            100,
            Some(RequestError::new(ErrorKind::Connection, "x")),
        )]));
        assert!(state.progress_points.is_empty());
    }

    #[test]
    fn test_percentages() {
        let mut state = AggregateSummary::default();
        assert_eq!(state.success_percentage(), 0);
        for _ in 0..3 {
            state.record(&scenario_result(vec![step_result(1, 10, None)]));
        }
        state.record(&scenario_result(vec![step_result(
            1,
            10,
            Some(RequestError::new(ErrorKind::Connection, "x")),
        )]));
        assert_eq!(state.success_percentage(), 75);
        assert_eq!(state.failed_percentage(), 25);
    }

    #[test]
    fn test_metric_count_tracks_entries() {
        let mut state = AggregateSummary::default();
        state.record(&scenario_result(vec![step_result(1, 10, None)]));
        // Five base phases are always present.
        assert_eq!(state.total_metric_count, 5);
    }

    #[tokio::test]
    async fn test_aggregator_consumes_until_close() {
        let (tx, rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(AggregateSummary::default());

        for _ in 0..5 {
            tx.send(scenario_result(vec![step_result(1, 10, None)]))
                .await
                .unwrap();
        }
        drop(tx);

        let state = run_aggregator(rx, snapshot_tx, false).await;
        assert_eq!(state.success_count, 5);
        assert_eq!(snapshot_rx.borrow().success_count, 5);
    }
}
