//! Extraction collaborator: raw model text in, verifiable unit out.

pub mod lean;

pub use lean::LeanBlockExtractor;

use crate::error::ExtractionError;
use crate::problem::Problem;

/// Turns raw model output into zero or one verifiable unit.
pub trait Extractor: Send + Sync {
    /// Returns the complete unit to hand to the verifier.
    fn extract(&self, problem: &Problem, raw: &str) -> Result<String, ExtractionError>;
}
