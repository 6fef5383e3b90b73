//! Terminal rendering for the final summary and debug dumps.
//!
//! Pure functions: structured data in, formatted `String` out. Color is
//! applied through the `colored` crate, which honors the global override
//! when output is piped.

use std::time::Duration;

use colored::Colorize;

use crate::report::AggregateSummary;
use crate::result::StepResult;

/// Width for dotted metric row padding.
const PAD_WIDTH: usize = 32;

/// Render the end-of-test summary.
pub fn render_summary(state: &AggregateSummary, elapsed: Duration) -> String {
    let mut lines = Vec::new();

    lines.push(String::new());
    lines.push(format!("  {}", "test completed".bold()));
    lines.push(String::new());

    let success = format!(
        "{} ({}%)",
        state.success_count,
        state.success_percentage()
    );
    lines.push(metric_row("success_count", &success.green().to_string()));

    let failed = format!("{} ({}%)", state.failed_count, state.failed_percentage());
    let failed = if state.failed_count > 0 {
        failed.red().to_string()
    } else {
        failed
    };
    lines.push(metric_row("failed_count", &failed));

    lines.push(metric_row(
        "avg_duration",
        &format!("{:.4}s", state.avg_duration),
    ));
    lines.push(metric_row("total_requests", &state.total_requests.to_string()));
    lines.push(metric_row("elapsed", &format!("{:.1}s", elapsed.as_secs_f64())));

    if !state.status_codes.is_empty() {
        lines.push(String::new());
        lines.push("  status codes:".to_string());
        for (code, count) in &state.status_codes {
            let label = if *code == 0 {
                "no response".to_string()
            } else {
                code.to_string()
            };
            lines.push(metric_row(&format!("  {label}"), &count.to_string()));
        }
    }

    for (id, step) in &state.steps {
        lines.push(String::new());
        lines.push(format!("  {} {}", format!("step {id}").bold(), step.name));
        lines.push(metric_row("  success", &step.success_count.to_string()));
        lines.push(metric_row("  fail", &step.fail_count.to_string()));
        for (name, mean) in &step.durations {
            lines.push(metric_row(&format!("  {name}"), &format!("{:.4}s", mean)));
        }
        for (reason, count) in &step.errors {
            lines.push(metric_row(
                &format!("  {}", reason.red()),
                &count.to_string(),
            ));
        }
    }

    if !state.progress_points.is_empty() {
        lines.push(String::new());
        lines.push("  progress points:".to_string());
        // The map records a point for every milestone hit; show only the
        // quantiles of the final success count.
        let total = state.success_count as f64;
        let mut shown = std::collections::BTreeSet::new();
        for percent in [0.10, 0.25, 0.40, 0.50, 0.75, 0.90, 1.00] {
            let milestone = (total * percent).ceil() as u64;
            if !shown.insert(milestone) {
                continue;
            }
            if let Some(duration) = state.progress_points.get(&milestone) {
                lines.push(metric_row(
                    &format!("  at {milestone}"),
                    &format!("{duration:.4}s"),
                ));
            }
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Render a verbose dump of one step result (debug mode).
pub fn render_step_debug(step: &StepResult) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} step {} {}",
        "debug".cyan().bold(),
        step.step_id,
        step.step_name
    ));

    if let Some(dump) = &step.debug {
        lines.push(format!("  {} {}", dump.method.bold(), dump.url));
        lines.push("  request headers:".to_string());
        for (k, v) in &dump.request_headers {
            lines.push(format!("    {k}: {v}"));
        }
        if !dump.request_body.is_empty() {
            lines.push("  request body:".to_string());
            lines.push(indent(&render_body(&dump.request_headers, &dump.request_body)));
        }
        lines.push(format!("  status: {}", step.status_code));
        lines.push("  response headers:".to_string());
        for (k, v) in &dump.response_headers {
            lines.push(format!("    {k}: {v}"));
        }
        if !dump.response_body.is_empty() {
            lines.push("  response body:".to_string());
            lines.push(indent(&render_body(&dump.response_headers, &dump.response_body)));
        }
    }

    if !step.usable.is_empty() {
        lines.push("  environment:".to_string());
        let mut envs: Vec<_> = step.usable.iter().collect();
        envs.sort();
        for (k, v) in envs {
            lines.push(format!("    {k}={v}"));
        }
    }
    if !step.failed_captures.is_empty() {
        lines.push("  failed captures:".to_string());
        let mut failed: Vec<_> = step.failed_captures.iter().collect();
        failed.sort();
        for (name, reason) in failed {
            lines.push(format!("    {name}: {reason}"));
        }
    }
    if let Some(err) = &step.error {
        lines.push(format!("  {} {err}", "error:".red()));
    }
    lines.join("\n")
}

/// Pretty-print JSON bodies; everything else passes through as text.
fn render_body(headers: &[(String, String)], body: &[u8]) -> String {
    let json = headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && v.contains("application/json"));
    if json {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            if let Ok(pretty) = serde_json::to_string_pretty(&value) {
                return pretty;
            }
        }
    }
    String::from_utf8_lossy(body).to_string()
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn metric_row(name: &str, value: &str) -> String {
    let dots = PAD_WIDTH.saturating_sub(name.len());
    format!("  {}{}: {}", name, ".".repeat(dots), value)
}
