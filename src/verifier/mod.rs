//! Verification adapter.
//!
//! Stages a unit inside the verifier project root, runs the configured
//! verifier command through the [`crate::sandbox`], and classifies the result
//! into a [`VerificationOutcome`].

pub mod adapter;
pub mod diagnostics;
pub mod outcome;

pub use adapter::{
    classify, Verifier, VerifierCommand, VerifierConfig, VerifyError, DEFAULT_REJECT_MARKERS,
    PROJECT_MANIFESTS,
};
pub use diagnostics::{DiagnosticMatcher, RegexDiagnosticMatcher, DEFAULT_DIAGNOSTIC_PATTERNS};
pub use outcome::{OutcomeKind, VerificationOutcome};
