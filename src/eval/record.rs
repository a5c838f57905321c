//! Persisted records: attempts, per-problem results, shard results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::partition::PartitionKind;
use crate::problem::PromptMode;
use crate::verifier::{OutcomeKind, VerificationOutcome};

/// Maximum bytes of raw model output kept per attempt.
pub const MAX_RAW_OUTPUT_BYTES: usize = 20_000;
/// Maximum bytes of extracted unit kept per attempt.
pub const MAX_UNIT_BYTES: usize = 20_000;
/// Maximum bytes of error detail kept per attempt.
pub const MAX_DETAIL_BYTES: usize = 4_000;

/// One sampling trial for one problem. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 0-based, unique within the problem.
    pub attempt_index: u32,
    pub outcome: OutcomeKind,
    /// Present only for failing outcomes.
    pub error_detail: Option<String>,
    /// Absent when generation failed.
    pub raw_model_output: Option<String>,
    /// Absent when generation or extraction failed.
    pub extracted_unit: Option<String>,
    pub generation_time_secs: f64,
    pub verification_time_secs: f64,
    pub total_time_secs: f64,
    pub started_at: DateTime<Utc>,
}

impl Attempt {
    /// Generation errored or timed out.
    pub fn generation_failed(
        attempt_index: u32,
        started_at: DateTime<Utc>,
        generation_time_secs: f64,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            attempt_index,
            outcome: OutcomeKind::GenerationFailed,
            error_detail: Some(truncate(&detail.into(), MAX_DETAIL_BYTES)),
            raw_model_output: None,
            extracted_unit: None,
            generation_time_secs,
            verification_time_secs: 0.0,
            total_time_secs: generation_time_secs,
            started_at,
        }
    }

    /// No unit could be extracted from the model text.
    pub fn extraction_failed(
        attempt_index: u32,
        started_at: DateTime<Utc>,
        raw_model_output: &str,
        generation_time_secs: f64,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            attempt_index,
            outcome: OutcomeKind::ExtractionFailed,
            error_detail: Some(truncate(&detail.into(), MAX_DETAIL_BYTES)),
            raw_model_output: Some(truncate(raw_model_output, MAX_RAW_OUTPUT_BYTES)),
            extracted_unit: None,
            generation_time_secs,
            verification_time_secs: 0.0,
            total_time_secs: generation_time_secs,
            started_at,
        }
    }

    /// The verifier ran and produced `outcome`.
    pub fn verified(
        attempt_index: u32,
        started_at: DateTime<Utc>,
        raw_model_output: &str,
        extracted_unit: &str,
        generation_time_secs: f64,
        verification_time_secs: f64,
        outcome: &VerificationOutcome,
    ) -> Self {
        let kind = outcome.kind();
        let error_detail = match (kind, outcome.detail()) {
            (OutcomeKind::Success, _) => None,
            (_, Some(detail)) => Some(truncate(detail, MAX_DETAIL_BYTES)),
            (OutcomeKind::Timeout, None) => Some(format!(
                "verification timed out after {:.1}s",
                verification_time_secs
            )),
            (_, None) => None,
        };
        Self {
            attempt_index,
            outcome: kind,
            error_detail,
            raw_model_output: Some(truncate(raw_model_output, MAX_RAW_OUTPUT_BYTES)),
            extracted_unit: Some(truncate(extracted_unit, MAX_UNIT_BYTES)),
            generation_time_secs,
            verification_time_secs,
            total_time_secs: generation_time_secs + verification_time_secs,
            started_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == OutcomeKind::Success
    }
}

/// All attempts for one problem plus derived fields.
///
/// `passed`, `first_success_index`, `num_attempts` and the time totals are
/// always recomputed from `attempts` by [`ProblemResult::finalize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemResult {
    pub problem_id: String,
    pub mode: PromptMode,
    /// Attempts planned.
    pub num_samples: u32,
    /// Attempts recorded; below `num_samples` only after an early stop.
    pub num_attempts: u32,
    pub passed: bool,
    pub first_success_index: Option<u32>,
    pub early_stopped: bool,
    pub total_generation_time_secs: f64,
    pub total_verification_time_secs: f64,
    pub total_time_secs: f64,
    pub attempts: Vec<Attempt>,
    /// Absent while the problem is still in progress.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProblemResult {
    /// An in-progress result with no attempts.
    pub fn new(problem_id: impl Into<String>, mode: PromptMode, num_samples: u32) -> Self {
        Self {
            problem_id: problem_id.into(),
            mode,
            num_samples,
            num_attempts: 0,
            passed: false,
            first_success_index: None,
            early_stopped: false,
            total_generation_time_secs: 0.0,
            total_verification_time_secs: 0.0,
            total_time_secs: 0.0,
            attempts: Vec::new(),
            completed_at: None,
        }
    }

    /// Appends an attempt and refreshes derived fields.
    pub fn push(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
        self.finalize();
    }

    /// Recomputes derived fields from the attempts.
    pub fn finalize(&mut self) {
        self.attempts.sort_by_key(|a| a.attempt_index);
        self.num_attempts = self.attempts.len() as u32;
        self.first_success_index = self
            .attempts
            .iter()
            .filter(|a| a.is_success())
            .map(|a| a.attempt_index)
            .min();
        self.passed = self.first_success_index.is_some();
        self.total_generation_time_secs = self.attempts.iter().map(|a| a.generation_time_secs).sum();
        self.total_verification_time_secs =
            self.attempts.iter().map(|a| a.verification_time_secs).sum();
        self.total_time_secs = self.attempts.iter().map(|a| a.total_time_secs).sum();
    }

    /// Marks the result complete.
    pub fn complete(mut self, early_stopped: bool) -> Self {
        self.finalize();
        self.early_stopped = early_stopped;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Back to in-progress, keeping the recorded attempts.
    pub fn reopen(mut self) -> Self {
        self.early_stopped = false;
        self.completed_at = None;
        self
    }

    /// Index the next attempt would get.
    pub fn next_attempt_index(&self) -> u32 {
        self.attempts
            .iter()
            .map(|a| a.attempt_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// True if some attempt with index below `k` succeeded.
    pub fn solved_within(&self, k: u32) -> bool {
        self.attempts
            .iter()
            .any(|a| a.attempt_index < k && a.is_success())
    }

    pub fn has_timeout(&self) -> bool {
        self.attempts.iter().any(|a| a.outcome == OutcomeKind::Timeout)
    }
}

/// Output of one shard run. Written once at the end of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardResult {
    pub run_id: String,
    pub shard_id: usize,
    pub shard_count: usize,
    pub mode: PromptMode,
    pub partition: PartitionKind,
    /// Fingerprint of the full problem set the shard was cut from.
    pub problem_set_fingerprint: String,
    /// Size of the full problem set.
    pub total_problems: usize,
    /// Problems assigned to this shard, in canonical order.
    pub assigned_ids: Vec<String>,
    pub results: Vec<ProblemResult>,
    pub num_samples: u32,
    pub early_stop_on_success: bool,
    #[serde(default)]
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ShardResult {
    /// Ids with a result, in result order.
    pub fn result_ids(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.problem_id.as_str()).collect()
    }
}

/// Truncates to at most `max` bytes on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}... [truncated]", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(index: u32, outcome: OutcomeKind) -> Attempt {
        Attempt {
            attempt_index: index,
            outcome,
            error_detail: None,
            raw_model_output: None,
            extracted_unit: None,
            generation_time_secs: 1.0,
            verification_time_secs: 2.0,
            total_time_secs: 3.0,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_verifier_error_success_timeout() {
        let mut result = ProblemResult::new("p", PromptMode::NonCot, 3);
        result.push(attempt(0, OutcomeKind::VerifierError));
        result.push(attempt(1, OutcomeKind::Success));
        result.push(attempt(2, OutcomeKind::Timeout));
        let result = result.complete(false);

        assert!(result.passed);
        assert_eq!(result.first_success_index, Some(1));
        assert_eq!(result.num_attempts, 3);
        assert!(result.has_timeout());
        assert!(!result.solved_within(1));
        assert!(result.solved_within(2));
        assert_eq!(result.total_time_secs, 9.0);
    }

    #[test]
    fn test_no_success_has_no_first_index() {
        let mut result = ProblemResult::new("p", PromptMode::Cot, 2);
        result.push(attempt(0, OutcomeKind::GenerationFailed));
        result.push(attempt(1, OutcomeKind::IncorrectNoDiagnostic));
        assert!(!result.passed);
        assert_eq!(result.first_success_index, None);
        assert_eq!(result.next_attempt_index(), 2);
        assert!(!result.is_complete());
    }

    #[test]
    fn test_first_success_null_in_json() {
        let result = ProblemResult::new("p", PromptMode::NonCot, 1).complete(false);
        let json = serde_json::to_value(&result).unwrap();
        assert!(json["first_success_index"].is_null());
        assert_eq!(json["mode"], "noncot");
    }

    #[test]
    fn test_verified_attempt_fields() {
        let outcome = VerificationOutcome::VerifierError {
            diagnostic: "x.lean:1:1: error: bad".into(),
        };
        let a = Attempt::verified(4, Utc::now(), "raw", "unit", 1.5, 2.5, &outcome);
        assert_eq!(a.outcome, OutcomeKind::VerifierError);
        assert_eq!(a.total_time_secs, 4.0);
        assert_eq!(a.error_detail.as_deref(), Some("x.lean:1:1: error: bad"));

        let ok = Attempt::verified(0, Utc::now(), "raw", "unit", 1.0, 1.0, &VerificationOutcome::Success);
        assert!(ok.error_detail.is_none());

        let timeout =
            Attempt::verified(0, Utc::now(), "raw", "unit", 1.0, 1.0, &VerificationOutcome::Timeout);
        assert!(timeout.error_detail.unwrap().contains("timed out"));
    }

    #[test]
    fn test_generation_failed_attempt() {
        let a = Attempt::generation_failed(2, Utc::now(), 300.0, "timed out");
        assert_eq!(a.outcome, OutcomeKind::GenerationFailed);
        assert!(a.raw_model_output.is_none());
        assert_eq!(a.total_time_secs, 300.0);
    }

    #[test]
    fn test_truncate_long_text() {
        let text = "é".repeat(3000);
        let out = truncate(&text, 4001);
        assert!(out.ends_with("... [truncated]"));
        assert!(out.len() <= 4001 + "... [truncated]".len());
        assert_eq!(truncate("short", 10), "short");
    }
}
