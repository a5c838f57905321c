//! prover-eval: sharded evaluation of machine-generated formal proofs.
//!
//! A language model is sampled for candidate Lean proofs; each candidate is
//! checked by the Lean toolchain inside an isolated process group with a hard
//! timeout, and Pass@k is reported over the problem set. Large problem sets
//! are split into shards that run independently and are merged afterwards.
//!
//! - [`sandbox`]: process-group isolation, bounded capture, teardown
//! - [`verifier`]: runs the proof checker and classifies its output
//! - [`eval`]: attempts, per-problem sampling, shard orchestration, storage
//! - [`metrics`]: Pass@k, timing statistics, shard merging

pub mod cli;
pub mod config;
pub mod error;
pub mod eval;
pub mod extract;
pub mod metrics;
pub mod model;
pub mod problem;
pub mod sandbox;
pub mod verifier;

pub use config::EvalConfig;
pub use error::{CoverageError, EvalError, ExtractionError, GenerationError, SandboxError, StoreError};
pub use eval::{AttemptRunner, ProblemEvaluator, ShardOrchestrator};
pub use metrics::{merge, summarize, MetricsSummary};
pub use problem::{Problem, ProblemSet, PromptMode};
pub use verifier::{OutcomeKind, VerificationOutcome, Verifier};
