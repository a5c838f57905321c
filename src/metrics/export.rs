//! Human-readable outputs for a set of results.
//!
//! ```text
//! <out_dir>/
//!   summary.csv              one row per problem
//!   OVERVIEW.md              headline metrics, failures, timing
//!   successes/<stem>.txt     first verified unit of each solved problem
//!   failures/<stem>.txt      every attempt of each unsolved problem
//! ```
//!
//! `successes/` and `failures/` are rebuilt on every call so they never mix
//! problems from different runs.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::info;

use super::summary::MetricsSummary;
use crate::error::StoreError;
use crate::eval::record::truncate;
use crate::eval::store::file_stem;
use crate::eval::ProblemResult;
use crate::problem::PromptMode;
use crate::verifier::OutcomeKind;

pub const SUMMARY_CSV: &str = "summary.csv";
pub const OVERVIEW_FILE: &str = "OVERVIEW.md";
pub const SUCCESSES_DIR: &str = "successes";
pub const FAILURES_DIR: &str = "failures";

const CSV_HEADER: &str = "problem_id,passed,first_success_attempt,num_attempts,num_successful_attempts,num_timeouts,avg_generation_time_s,avg_verification_time_s";
const MAX_DETAIL_SNIPPET: usize = 2_000;
const MAX_UNIT_SNIPPET: usize = 1_500;

/// What [`write_run_outputs`] produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutputs {
    pub summary_csv: PathBuf,
    pub overview: PathBuf,
    pub successes: usize,
    pub failures: usize,
}

/// Writes the CSV, the overview and the per-problem files into `out_dir`.
pub fn write_run_outputs(
    out_dir: &Path,
    mode: PromptMode,
    results: &[ProblemResult],
    summary: &MetricsSummary,
) -> Result<RunOutputs, StoreError> {
    let successes_dir = out_dir.join(SUCCESSES_DIR);
    let failures_dir = out_dir.join(FAILURES_DIR);
    for dir in [&successes_dir, &failures_dir] {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(dir, e)),
        }
        std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    }

    let mut csv = String::from(CSV_HEADER);
    csv.push('\n');
    let (mut successes, mut failures) = (0, 0);
    for result in results {
        csv.push_str(&csv_row(result));
        csv.push('\n');

        let name = format!("{}.txt", file_stem(&result.problem_id));
        match success_text(result, mode) {
            Some(text) => {
                write_text(&successes_dir.join(name), &text)?;
                successes += 1;
            }
            None => {
                write_text(&failures_dir.join(name), &failure_text(result, mode))?;
                failures += 1;
            }
        }
    }

    let summary_csv = out_dir.join(SUMMARY_CSV);
    write_text(&summary_csv, &csv)?;
    let overview = out_dir.join(OVERVIEW_FILE);
    write_text(&overview, &overview_markdown(mode, summary))?;

    info!(
        dir = %out_dir.display(),
        problems = results.len(),
        successes,
        failures,
        "Wrote run outputs"
    );
    Ok(RunOutputs {
        summary_csv,
        overview,
        successes,
        failures,
    })
}

fn write_text(path: &Path, text: &str) -> Result<(), StoreError> {
    std::fs::write(path, text).map_err(|e| StoreError::io(path, e))
}

/// Quotes a CSV field when it holds a separator, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// `first_success_attempt` is empty for unsolved problems.
fn csv_row(result: &ProblemResult) -> String {
    let attempts = &result.attempts;
    format!(
        "{},{},{},{},{},{},{:.2},{:.2}",
        csv_field(&result.problem_id),
        result.passed,
        result
            .first_success_index
            .map(|i| i.to_string())
            .unwrap_or_default(),
        attempts.len(),
        attempts.iter().filter(|a| a.is_success()).count(),
        attempts.iter().filter(|a| a.outcome == OutcomeKind::Timeout).count(),
        mean(attempts.iter().map(|a| a.generation_time_secs)),
        mean(attempts.iter().map(|a| a.verification_time_secs)),
    )
}

fn success_text(result: &ProblemResult, mode: PromptMode) -> Option<String> {
    let index = result.first_success_index?;
    let attempt = result.attempts.iter().find(|a| a.attempt_index == index)?;
    let mut text = String::new();
    let _ = writeln!(text, "Problem: {}", result.problem_id);
    let _ = writeln!(text, "Mode: {}", mode);
    let _ = writeln!(text, "First success attempt: {}", index);
    let _ = writeln!(text, "Generation time (s): {:.2}", attempt.generation_time_secs);
    let _ = writeln!(text, "Verification time (s): {:.2}", attempt.verification_time_secs);
    let _ = writeln!(text, "\n==== Verified unit ====");
    text.push_str(attempt.extracted_unit.as_deref().unwrap_or("[no unit recorded]"));
    text.push('\n');
    Some(text)
}

fn failure_text(result: &ProblemResult, mode: PromptMode) -> String {
    let timeouts = result
        .attempts
        .iter()
        .filter(|a| a.outcome == OutcomeKind::Timeout)
        .count();
    let mut text = String::new();
    let _ = writeln!(text, "Problem: {}", result.problem_id);
    let _ = writeln!(text, "Mode: {}", mode);
    let _ = writeln!(text, "Attempts: {}/{}", result.num_attempts, result.num_samples);
    let _ = writeln!(text, "Timeout attempts: {}", timeouts);
    for attempt in &result.attempts {
        let _ = writeln!(text, "\n--- Attempt {}: {} ---", attempt.attempt_index, attempt.outcome);
        let _ = writeln!(
            text,
            "Times (generation/verification/total): {:.2} / {:.2} / {:.2} s",
            attempt.generation_time_secs, attempt.verification_time_secs, attempt.total_time_secs
        );
        if let Some(detail) = &attempt.error_detail {
            let _ = writeln!(text, "Detail:\n{}", truncate(detail, MAX_DETAIL_SNIPPET));
        }
        if let Some(unit) = &attempt.extracted_unit {
            let _ = writeln!(text, "Unit:\n{}", truncate(unit, MAX_UNIT_SNIPPET));
        }
    }
    text
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * part as f64 / total as f64
    }
}

/// Markdown overview of `summary`.
pub fn overview_markdown(mode: PromptMode, summary: &MetricsSummary) -> String {
    let total = summary.total_problems;
    let failed = total - summary.problems_passed;
    let mut md = String::new();
    let _ = writeln!(md, "# {} overview\n", mode.label().to_uppercase());

    let _ = writeln!(md, "## Summary");
    let _ = writeln!(md, "- Problems: {}", total);
    let _ = writeln!(
        md,
        "- Passed: {} ({:.2}%)",
        summary.problems_passed,
        percent(summary.problems_passed, total)
    );
    let _ = writeln!(md, "- Failed: {} ({:.2}%)", failed, percent(failed, total));
    for p in &summary.pass_at_k {
        let _ = writeln!(md, "- Pass@{}: {:.2}%", p.k, p.rate * 100.0);
    }
    let _ = writeln!(md, "- Attempts: {} (samples per problem: {})", summary.total_attempts, summary.num_samples);
    let _ = writeln!(md, "- Early-stopped problems: {}\n", summary.early_stopped_problems);

    let failures = &summary.failure_breakdown;
    let _ = writeln!(md, "## Failures");
    let _ = writeln!(md, "- Timeout-related: {}", failures.timeout);
    let _ = writeln!(md, "- Verifier errors: {}", failures.verifier_error);
    let _ = writeln!(md, "- Generation failures: {}", failures.generation_failed);
    let _ = writeln!(md, "- Extraction failures: {}", failures.extraction_failed);
    let _ = writeln!(md, "- Incorrect (no diagnostic): {}", failures.incorrect);
    let _ = writeln!(md, "- Attempts that timed out: {}", summary.timeout_attempts);
    let _ = writeln!(md, "- Problems with any timeout: {}\n", summary.problems_with_timeout.len());

    let _ = writeln!(md, "## Timing (per attempt)");
    for (label, stats) in [
        ("Generation", &summary.generation_time),
        ("Verification", &summary.verification_time),
        ("Total", &summary.total_time),
    ] {
        let _ = writeln!(
            md,
            "- {}: mean {:.2}s, median {:.2}s, p90 {:.2}s, p95 {:.2}s",
            label, stats.mean, stats.median, stats.p90, stats.p95
        );
    }
    md.push('\n');

    if !summary.first_success_histogram.is_empty() {
        let _ = writeln!(md, "## First success attempt");
        for (index, count) in &summary.first_success_histogram {
            let _ = writeln!(md, "- Attempt {}: {} problems", index, count);
        }
        md.push('\n');
    }

    if !summary.slowest_problems.is_empty() {
        let _ = writeln!(md, "## Slowest problems (mean time per attempt)");
        for p in &summary.slowest_problems {
            let _ = writeln!(md, "- {}: {:.2}s over {} attempts", p.problem_id, p.mean_attempt_secs, p.attempts);
        }
        md.push('\n');
    }

    let _ = writeln!(md, "## Files");
    let _ = writeln!(md, "- {}: one row per problem", SUMMARY_CSV);
    let _ = writeln!(md, "- {}/: first verified unit of each solved problem", SUCCESSES_DIR);
    let _ = writeln!(md, "- {}/: every attempt of each unsolved problem", FAILURES_DIR);
    md
}
