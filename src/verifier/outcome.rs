//! Attempt outcomes.

use serde::{Deserialize, Serialize};

/// Terminal outcome of one attempt, as persisted and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// The verifier accepted the unit.
    Success,
    /// The verifier hit its wall-clock limit.
    Timeout,
    /// The verifier rejected the unit with a recognizable diagnostic.
    VerifierError,
    /// The verifier rejected the unit without a recognizable diagnostic.
    IncorrectNoDiagnostic,
    /// The model produced no text (error or generation timeout).
    GenerationFailed,
    /// No verifiable unit could be extracted from the model text.
    ExtractionFailed,
}

impl OutcomeKind {
    /// All kinds, in reporting order.
    pub const ALL: [OutcomeKind; 6] = [
        OutcomeKind::Success,
        OutcomeKind::Timeout,
        OutcomeKind::VerifierError,
        OutcomeKind::IncorrectNoDiagnostic,
        OutcomeKind::GenerationFailed,
        OutcomeKind::ExtractionFailed,
    ];

    /// Returns true for every kind except `Success`.
    pub fn is_failure(&self) -> bool {
        !matches!(self, OutcomeKind::Success)
    }

    /// Snake-case label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::VerifierError => "verifier_error",
            OutcomeKind::IncorrectNoDiagnostic => "incorrect_no_diagnostic",
            OutcomeKind::GenerationFailed => "generation_failed",
            OutcomeKind::ExtractionFailed => "extraction_failed",
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of classifying one verifier run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Success,
    Timeout,
    VerifierError { diagnostic: String },
    IncorrectNoDiagnostic { detail: String },
}

impl VerificationOutcome {
    /// The persisted kind.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            VerificationOutcome::Success => OutcomeKind::Success,
            VerificationOutcome::Timeout => OutcomeKind::Timeout,
            VerificationOutcome::VerifierError { .. } => OutcomeKind::VerifierError,
            VerificationOutcome::IncorrectNoDiagnostic { .. } => {
                OutcomeKind::IncorrectNoDiagnostic
            }
        }
    }

    /// Free-text detail for failing outcomes.
    pub fn detail(&self) -> Option<&str> {
        match self {
            VerificationOutcome::Success | VerificationOutcome::Timeout => None,
            VerificationOutcome::VerifierError { diagnostic } => Some(diagnostic),
            VerificationOutcome::IncorrectNoDiagnostic { detail } => Some(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_kind_serde() {
        let json = serde_json::to_string(&OutcomeKind::IncorrectNoDiagnostic).unwrap();
        assert_eq!(json, "\"incorrect_no_diagnostic\"");
        let back: OutcomeKind = serde_json::from_str("\"verifier_error\"").unwrap();
        assert_eq!(back, OutcomeKind::VerifierError);
    }

    #[test]
    fn test_outcome_kind_display_matches_serde() {
        for kind in OutcomeKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json.trim_matches('"'), kind.to_string());
        }
    }

    #[test]
    fn test_verification_outcome_detail() {
        assert_eq!(VerificationOutcome::Success.detail(), None);
        assert_eq!(VerificationOutcome::Timeout.kind(), OutcomeKind::Timeout);
        let err = VerificationOutcome::VerifierError {
            diagnostic: "x.lean:3:2: error: unsolved goals".into(),
        };
        assert_eq!(err.kind(), OutcomeKind::VerifierError);
        assert!(err.detail().unwrap().contains("unsolved goals"));
    }
}
