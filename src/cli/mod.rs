//! Command-line interface for prover-eval.
//!
//! Provides commands for running a shard, merging shard outputs, summarizing
//! results and checking the verifier setup.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
