//! Tick schedule construction.
//!
//! A plan is compiled into `req_count[0..T)` where `T = duration × 10`
//! (one slot per 100 ms tick). At tick `k` the driver launches exactly
//! `req_count[k]` scenario iterations. All distributions are
//! deterministic and sum-preserving.

use std::time::Duration;

use crate::plan::{LoadPlan, LoadShape};

/// Scheduler resolution: ten 100 ms ticks per second.
pub const TICKS_PER_SECOND: usize = 10;

/// Interval between driver ticks.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Compile the plan into its per-tick request counts.
pub fn build(plan: &LoadPlan) -> Vec<u64> {
    // Debug mode runs one iteration per tick, sequentially.
    if plan.debug {
        return vec![1; plan.effective_iterations() as usize];
    }

    let seconds = plan.effective_duration_secs() as usize;
    let mut ticks = vec![0u64; seconds * TICKS_PER_SECOND];

    if !plan.program.is_empty() {
        fill_manual(plan, &mut ticks);
    } else {
        match plan.shape {
            LoadShape::Linear => {
                let per_second = linear_dist(plan.iteration_count, seconds);
                spread_over_ticks(&mut ticks, 0, &per_second);
            }
            LoadShape::Incremental => {
                let per_second = incremental_dist(plan.iteration_count, seconds);
                spread_over_ticks(&mut ticks, 0, &per_second);
            }
            LoadShape::Waved => fill_waved(plan.iteration_count, seconds as u64, &mut ticks),
        }
    }
    ticks
}

/// Explicit time/count program: each entry is linearly distributed over
/// its own seconds, then each second over its ticks; entries concatenate.
fn fill_manual(plan: &LoadPlan, ticks: &mut [u64]) {
    let mut start_sec = 0usize;
    for entry in &plan.program {
        let per_second = linear_dist(entry.count, entry.duration_secs as usize);
        spread_over_ticks(ticks, start_sec, &per_second);
        start_sec += per_second.len();
    }
}

/// Waved shape: `max(1, ⌊log₂ duration⌋)` quarter-waves, each an
/// incremental ramp, reversed on odd quarters; the last quarter absorbs
/// the iteration remainder.
fn fill_waved(count: u64, duration: u64, ticks: &mut [u64]) {
    let quarters = duration.ilog2().max(1) as u64;
    let quarter_duration = (duration / quarters) as usize;
    let base_per_quarter = count / quarters;

    let mut start_sec = 0usize;
    for q in 0..quarters {
        let mut per_quarter = base_per_quarter;
        if q == quarters - 1 {
            per_quarter += count - base_per_quarter * quarters;
        }
        let mut per_second = incremental_dist(per_quarter, quarter_duration);
        if q % 2 == 1 {
            per_second.reverse();
        }
        spread_over_ticks(ticks, start_sec, &per_second);
        start_sec += per_second.len();
    }
}

/// Linearly distribute each second's count over its ten ticks, starting
/// at `start_sec`.
fn spread_over_ticks(ticks: &mut [u64], start_sec: usize, per_second: &[u64]) {
    for (i, &count) in per_second.iter().enumerate() {
        let begin = (start_sec + i) * TICKS_PER_SECOND;
        linear_fill(count, &mut ticks[begin..begin + TICKS_PER_SECOND]);
    }
}

/// Linear distribution of `count` over `len` slots: every slot gets
/// `⌊count/len⌋`, the first `count mod len` slots one extra.
pub fn linear_dist(count: u64, len: usize) -> Vec<u64> {
    let mut arr = vec![0u64; len];
    linear_fill(count, &mut arr);
    arr
}

fn linear_fill(count: u64, arr: &mut [u64]) {
    let len = arr.len() as u64;
    if len == 0 {
        return;
    }
    let base = count / len;
    let remainder = count - base * len;
    for (i, slot) in arr.iter_mut().enumerate() {
        *slot = base + u64::from((i as u64) < remainder);
    }
}

/// Incremental distribution of `count` over `len` slots: a monotonically
/// non-decreasing step function incrementing every
/// `⌈len(len+1)/(2·count)⌉` positions, rescaled by the integer factor
/// that brings its sum to `count`, with the final remainder added to the
/// last slots.
pub fn incremental_dist(count: u64, len: usize) -> Vec<u64> {
    if len == 0 {
        return Vec::new();
    }
    if count == 0 {
        return vec![0; len];
    }

    let triangular = (len as u64 * (len as u64 + 1)) / 2;
    let step = triangular.div_ceil(count).max(1) as usize;

    let mut slots = vec![0u64; len];
    let mut val = 0u64;
    for (i, slot) in slots.iter_mut().enumerate() {
        if i % step == 0 {
            val += 1;
        }
        *slot = val;
    }

    let sum: u64 = slots.iter().sum();
    let factor = count / sum;
    let remaining = count - sum * factor;
    let plus = remaining / len as u64;
    let last_remaining = remaining - plus * len as u64;

    for (i, slot) in slots.iter_mut().enumerate() {
        *slot = *slot * factor + plus;
        if ((len - i - 1) as u64) < last_remaining {
            *slot += 1;
        }
    }
    slots
}
