//! Error types for prover-eval operations.
//!
//! Two families live here:
//! - per-attempt failures (`GenerationError`, `ExtractionError`) which are
//!   recorded as attempt outcomes and never abort a shard
//! - operation-aborting failures (`EvalError`, `CoverageError`) which end a
//!   shard run or a merge and must reach the operator

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the process sandbox for a single run.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to stage input file in {dir}: {source}")]
    Stage {
        dir: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Working directory does not exist: {0}")]
    MissingWorkingDir(String),

    #[error("Failed to signal process group {pgid}: {message}")]
    Signal { pgid: i32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the model collaborator.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Model generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse model response: {0}")]
    ParseError(String),

    #[error("Model returned an empty completion")]
    EmptyCompletion,

    #[error("Missing API base URL: MODEL_API_BASE environment variable not set")]
    MissingApiBase,
}

/// Errors from the extraction collaborator.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("No theorem name found in problem statement")]
    NoTheoremName,

    #[error("Model output does not contain 'theorem {0}'")]
    TheoremNotFound(String),

    #[error("Extracted solution block is empty")]
    EmptyBlock,
}

/// Errors that abort an evaluation (a shard run or a single-problem run).
#[derive(Debug, Error)]
pub enum EvalError {
    /// The sandbox could not be constructed: verifier project missing,
    /// verifier binary unavailable, temp unit could not be staged.
    #[error("Sandbox fatal: {0}")]
    SandboxFatal(String),

    /// Operator interrupt; in-flight work was torn down and not recorded.
    #[error("Evaluation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Problem set error: {0}")]
    ProblemSet(String),

    #[error("Result store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised while reading or writing persisted artifacts.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn json(path: &std::path::Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Merge-time failures: the shard outputs are not a disjoint cover of the
/// problem set they claim to partition.
#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("No shard results to merge")]
    NoShards,

    #[error("Shard {shard_id} was run with shard_count={found}, expected {expected}")]
    ShardCountMismatch {
        shard_id: usize,
        expected: usize,
        found: usize,
    },

    #[error("Shard {shard_id} was run in mode '{found}', expected '{expected}'")]
    ModeMismatch {
        shard_id: usize,
        expected: String,
        found: String,
    },

    #[error("Shard {shard_id} evaluated a different problem set (fingerprint {found}, expected {expected})")]
    FingerprintMismatch {
        shard_id: usize,
        expected: String,
        found: String,
    },

    #[error("Shard {shard_id} was run with num_samples={found}, expected {expected}")]
    NumSamplesMismatch {
        shard_id: usize,
        expected: u32,
        found: u32,
    },

    #[error("Shard id {shard_id} is out of range for shard_count={shard_count}")]
    ShardOutOfRange { shard_id: usize, shard_count: usize },

    #[error("Shard {0} appears more than once")]
    DuplicateShard(usize),

    #[error("Missing shards: {0:?}")]
    MissingShards(Vec<usize>),

    #[error("Shard {shard_id} is incomplete: {missing} assigned problems have no result")]
    IncompleteShard { shard_id: usize, missing: usize },

    #[error("Problem '{problem_id}' reported by shards {first} and {second}")]
    DuplicateProblem {
        problem_id: String,
        first: usize,
        second: usize,
    },

    #[error("Problems missing from merged result: {0:?}")]
    MissingProblems(Vec<String>),

    #[error("Problems not in the expected problem set: {0:?}")]
    UnexpectedProblems(Vec<String>),

    #[error("Merged {found} problems but the shards were cut from {expected}")]
    ProblemCountMismatch { expected: usize, found: usize },

    #[error("Shard {shard_id} assignment does not match the {strategy} partition")]
    PartitionMismatch { shard_id: usize, strategy: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
