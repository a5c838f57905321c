//! Metrics over a set of problem results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::stats::TimingStats;
use crate::eval::ProblemResult;
use crate::verifier::OutcomeKind;

/// Pass@k for one k.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassAtK {
    pub k: u32,
    pub solved: usize,
    pub total: usize,
    pub rate: f64,
}

/// Number of problems listed in [`MetricsSummary::slowest_problems`].
pub const SLOWEST_PROBLEMS: usize = 10;

/// Mean attempt time of one problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemTiming {
    pub problem_id: String,
    pub attempts: u32,
    pub mean_attempt_secs: f64,
}

/// Unsolved problems by the most telling failure among their attempts.
///
/// Each problem is counted once, under the first of: any timeout, any
/// verifier diagnostic, any generation failure, any extraction failure.
/// The rest are `incorrect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FailureBreakdown {
    pub timeout: usize,
    pub verifier_error: usize,
    pub generation_failed: usize,
    pub extraction_failed: usize,
    pub incorrect: usize,
}

impl FailureBreakdown {
    fn record(&mut self, result: &ProblemResult) {
        let any = |kind: OutcomeKind| result.attempts.iter().any(|a| a.outcome == kind);
        let slot = if any(OutcomeKind::Timeout) {
            &mut self.timeout
        } else if any(OutcomeKind::VerifierError) {
            &mut self.verifier_error
        } else if any(OutcomeKind::GenerationFailed) {
            &mut self.generation_failed
        } else if any(OutcomeKind::ExtractionFailed) {
            &mut self.extraction_failed
        } else {
            &mut self.incorrect
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.timeout + self.verifier_error + self.generation_failed + self.extraction_failed + self.incorrect
    }
}

/// Derived metrics. A pure function of its inputs; never a source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_problems: usize,
    pub problems_passed: usize,
    pub total_attempts: usize,
    pub num_samples: u32,
    pub pass_at_k: Vec<PassAtK>,
    /// Requested k values above `num_samples`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_k: Vec<u32>,
    /// Attempts per outcome kind; every kind is present.
    pub outcome_counts: BTreeMap<OutcomeKind, usize>,
    pub generation_time: TimingStats,
    pub verification_time: TimingStats,
    pub total_time: TimingStats,
    pub early_stopped_problems: usize,
    pub timeout_attempts: usize,
    /// Sorted ids of problems with at least one `Timeout` attempt.
    pub problems_with_timeout: Vec<String>,
    /// Solved problems keyed by the index of their first success.
    #[serde(default)]
    pub first_success_histogram: BTreeMap<u32, usize>,
    #[serde(default)]
    pub failure_breakdown: FailureBreakdown,
    /// Highest mean time per attempt first; ties by problem id.
    #[serde(default)]
    pub slowest_problems: Vec<ProblemTiming>,
}

impl MetricsSummary {
    /// Pass@k rate, if `k` was computed.
    pub fn pass_rate(&self, k: u32) -> Option<f64> {
        self.pass_at_k.iter().find(|p| p.k == k).map(|p| p.rate)
    }

    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.outcome_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Attempts that did not succeed.
    pub fn failed_attempts(&self) -> usize {
        self.total_attempts - self.count(OutcomeKind::Success)
    }
}

/// Summarizes `results`.
///
/// Pass@k is the fraction of problems with a `Success` among attempts whose
/// index is below `k`. Values of k above `num_samples` are skipped.
pub fn summarize(results: &[ProblemResult], k_values: &[u32], num_samples: u32) -> MetricsSummary {
    let mut ks: Vec<u32> = k_values.iter().copied().filter(|&k| k > 0).collect();
    ks.sort_unstable();
    ks.dedup();
    let (ks, skipped_k): (Vec<u32>, Vec<u32>) = ks.into_iter().partition(|&k| k <= num_samples);
    if !skipped_k.is_empty() {
        warn!(skipped = ?skipped_k, num_samples, "Skipping Pass@k for k above num_samples");
    }

    let total = results.len();
    let pass_at_k = ks
        .into_iter()
        .map(|k| {
            let solved = results.iter().filter(|r| r.solved_within(k)).count();
            PassAtK {
                k,
                solved,
                total,
                rate: if total == 0 { 0.0 } else { solved as f64 / total as f64 },
            }
        })
        .collect();

    let mut outcome_counts: BTreeMap<OutcomeKind, usize> =
        OutcomeKind::ALL.iter().map(|&k| (k, 0)).collect();
    let attempts = || results.iter().flat_map(|r| r.attempts.iter());
    for attempt in attempts() {
        *outcome_counts.entry(attempt.outcome).or_insert(0) += 1;
    }

    let mut problems_with_timeout: Vec<String> = results
        .iter()
        .filter(|r| r.has_timeout())
        .map(|r| r.problem_id.clone())
        .collect();
    problems_with_timeout.sort();

    let mut first_success_histogram = BTreeMap::new();
    let mut failure_breakdown = FailureBreakdown::default();
    for result in results {
        match result.first_success_index {
            Some(index) => *first_success_histogram.entry(index).or_insert(0) += 1,
            None => failure_breakdown.record(result),
        }
    }

    MetricsSummary {
        total_problems: total,
        problems_passed: results.iter().filter(|r| r.attempts.iter().any(|a| a.is_success())).count(),
        total_attempts: attempts().count(),
        num_samples,
        pass_at_k,
        skipped_k,
        timeout_attempts: outcome_counts[&OutcomeKind::Timeout],
        outcome_counts,
        generation_time: TimingStats::from_samples(attempts().map(|a| a.generation_time_secs)),
        verification_time: TimingStats::from_samples(attempts().map(|a| a.verification_time_secs)),
        total_time: TimingStats::from_samples(attempts().map(|a| a.total_time_secs)),
        early_stopped_problems: results.iter().filter(|r| r.early_stopped).count(),
        problems_with_timeout,
        first_success_histogram,
        failure_breakdown,
        slowest_problems: slowest_problems(results, SLOWEST_PROBLEMS),
    }
}

/// Problems with at least one attempt, slowest mean attempt first.
fn slowest_problems(results: &[ProblemResult], limit: usize) -> Vec<ProblemTiming> {
    let mut timings: Vec<ProblemTiming> = results
        .iter()
        .filter(|r| !r.attempts.is_empty())
        .map(|r| ProblemTiming {
            problem_id: r.problem_id.clone(),
            attempts: r.attempts.len() as u32,
            mean_attempt_secs: r.attempts.iter().map(|a| a.total_time_secs).sum::<f64>()
                / r.attempts.len() as f64,
        })
        .collect();
    timings.sort_by(|a, b| {
        b.mean_attempt_secs
            .total_cmp(&a.mean_attempt_secs)
            .then_with(|| a.problem_id.cmp(&b.problem_id))
    });
    timings.truncate(limit);
    timings
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Problems: {} ({} passed)", self.total_problems, self.problems_passed)?;
        for p in &self.pass_at_k {
            writeln!(f, "  Pass@{:<3} {:>7.2}% ({}/{})", p.k, p.rate * 100.0, p.solved, p.total)?;
        }
        writeln!(f, "Attempts: {}", self.total_attempts)?;
        for (kind, count) in &self.outcome_counts {
            writeln!(f, "  {:<24} {}", kind.to_string(), count)?;
        }
        for (label, stats) in [
            ("generation", &self.generation_time),
            ("verification", &self.verification_time),
            ("total", &self.total_time),
        ] {
            writeln!(
                f,
                "  {:<13} mean {:.2}s  median {:.2}s  p90 {:.2}s  p95 {:.2}s",
                label, stats.mean, stats.median, stats.p90, stats.p95
            )?;
        }
        let failures = &self.failure_breakdown;
        writeln!(
            f,
            "Unsolved: {} (timeout {}, verifier error {}, generation {}, extraction {}, incorrect {})",
            failures.total(),
            failures.timeout,
            failures.verifier_error,
            failures.generation_failed,
            failures.extraction_failed,
            failures.incorrect
        )?;
        if !self.first_success_histogram.is_empty() {
            writeln!(f, "First success at attempt:")?;
            for (index, count) in &self.first_success_histogram {
                writeln!(f, "  {:<4} {}", index, count)?;
            }
        }
        if !self.slowest_problems.is_empty() {
            writeln!(f, "Slowest problems (mean per attempt):")?;
            for p in &self.slowest_problems {
                writeln!(f, "  {:<32} {:.2}s", p.problem_id, p.mean_attempt_secs)?;
            }
        }
        write!(
            f,
            "Problems with timeouts: {}",
            self.problems_with_timeout.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::Attempt;
    use crate::problem::PromptMode;
    use chrono::Utc;

    fn attempt(index: u32, outcome: OutcomeKind, secs: f64) -> Attempt {
        Attempt {
            attempt_index: index,
            outcome,
            error_detail: None,
            raw_model_output: None,
            extracted_unit: None,
            generation_time_secs: secs,
            verification_time_secs: secs,
            total_time_secs: 2.0 * secs,
            started_at: Utc::now(),
        }
    }

    fn result(id: &str, outcomes: &[OutcomeKind]) -> ProblemResult {
        let mut r = ProblemResult::new(id, PromptMode::NonCot, 4);
        for (i, &o) in outcomes.iter().enumerate() {
            r.push(attempt(i as u32, o, 1.0 + i as f64));
        }
        r.complete(false)
    }

    fn sample() -> Vec<ProblemResult> {
        use OutcomeKind::*;
        vec![
            result("a", &[Success]),
            result("b", &[VerifierError, Success]),
            result("c", &[Timeout, IncorrectNoDiagnostic, GenerationFailed, Success]),
            result("d", &[ExtractionFailed, Timeout, Timeout, Timeout]),
        ]
    }

    #[test]
    fn test_pass_at_k() {
        let s = summarize(&sample(), &[1, 2, 4], 4);
        assert_eq!(s.pass_rate(1), Some(0.25));
        assert_eq!(s.pass_rate(2), Some(0.5));
        assert_eq!(s.pass_rate(4), Some(0.75));
        assert_eq!(s.problems_passed, 3);
    }

    #[test]
    fn test_pass_at_k_monotone() {
        let s = summarize(&sample(), &[4, 3, 2, 1], 4);
        let rates: Vec<f64> = s.pass_at_k.iter().map(|p| p.rate).collect();
        assert!(rates.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_k_above_num_samples_is_skipped() {
        let s = summarize(&sample(), &[1, 8, 32], 4);
        assert_eq!(s.pass_at_k.len(), 1);
        assert_eq!(s.skipped_k, vec![8, 32]);
        assert_eq!(s.pass_rate(8), None);
    }

    #[test]
    fn test_outcome_counts_and_timeouts() {
        let s = summarize(&sample(), &[1], 4);
        assert_eq!(s.total_attempts, 10);
        assert_eq!(s.count(OutcomeKind::Success), 3);
        assert_eq!(s.count(OutcomeKind::Timeout), 4);
        assert_eq!(s.timeout_attempts, 4);
        assert_eq!(s.failed_attempts(), 7);
        assert_eq!(s.problems_with_timeout, vec!["c", "d"]);
        assert_eq!(s.outcome_counts.len(), OutcomeKind::ALL.len());
    }

    #[test]
    fn test_timing_stats_cover_all_attempts() {
        let s = summarize(&sample(), &[1], 4);
        assert_eq!(s.generation_time.count, 10);
        assert_eq!(s.total_time.max, 8.0);
    }

    #[test]
    fn test_first_success_histogram() {
        let s = summarize(&sample(), &[1], 4);
        let expected: BTreeMap<u32, usize> = [(0, 1), (1, 1), (3, 1)].into_iter().collect();
        assert_eq!(s.first_success_histogram, expected);
    }

    #[test]
    fn test_failure_breakdown_counts_each_unsolved_problem_once() {
        use OutcomeKind::*;
        let results = vec![
            result("a", &[Success]),
            result("t", &[VerifierError, Timeout]),
            result("v", &[GenerationFailed, VerifierError]),
            result("g", &[ExtractionFailed, GenerationFailed]),
            result("e", &[ExtractionFailed]),
            result("i", &[IncorrectNoDiagnostic]),
        ];
        let s = summarize(&results, &[1], 4);
        assert_eq!(
            s.failure_breakdown,
            FailureBreakdown {
                timeout: 1,
                verifier_error: 1,
                generation_failed: 1,
                extraction_failed: 1,
                incorrect: 1,
            }
        );
        assert_eq!(s.failure_breakdown.total(), s.total_problems - s.problems_passed);
    }

    #[test]
    fn test_slowest_problems_by_mean_attempt_time() {
        use OutcomeKind::*;
        // Attempt i costs 2 * (1 + i) seconds.
        let results = vec![
            result("one", &[Success]),
            result("four", &[Timeout, Timeout, Timeout, Timeout]),
            result("two", &[VerifierError, Success]),
            result("also_two", &[Timeout, Success]),
            ProblemResult::new("none", PromptMode::NonCot, 4).complete(false),
        ];
        let s = summarize(&results, &[1], 4);
        let order: Vec<_> = s.slowest_problems.iter().map(|p| p.problem_id.as_str()).collect();
        assert_eq!(order, vec!["four", "also_two", "two", "one"]);
        assert_eq!(s.slowest_problems[0].mean_attempt_secs, 5.0);
        assert_eq!(s.slowest_problems[0].attempts, 4);

        let many: Vec<_> = (0..15).map(|i| result(&format!("p{:02}", i), &[Success])).collect();
        assert_eq!(summarize(&many, &[1], 4).slowest_problems.len(), SLOWEST_PROBLEMS);
    }

    #[test]
    fn test_empty_results() {
        let s = summarize(&[], &[1], 1);
        assert_eq!(s.pass_rate(1), Some(0.0));
        assert_eq!(s.total_attempts, 0);
    }

    #[test]
    fn test_summary_serializes_outcome_keys() {
        let s = summarize(&sample(), &[1], 4);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["outcome_counts"]["incorrect_no_diagnostic"], 1);
        let back: MetricsSummary = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_display_lists_pass_at_k() {
        let text = summarize(&sample(), &[1, 4], 4).to_string();
        assert!(text.contains("Pass@1"));
        assert!(text.contains("75.00%"));
    }
}
