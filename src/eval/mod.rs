//! Evaluation pipeline: attempts, problems, shards.
//!
//! - [`AttemptRunner`] runs one generate, extract, verify trial and always
//!   yields a complete [`Attempt`] unless the run is cancelled or the
//!   verifier is unusable
//! - [`ProblemEvaluator`] runs up to `num_samples` attempts per problem with
//!   optional early stop, checkpointing after every attempt
//! - [`ShardOrchestrator`] selects this shard's problems with a
//!   [`PartitionStrategy`] and evaluates them sequentially

pub mod attempt;
pub mod evaluator;
pub mod partition;
pub mod record;
pub mod shard;
pub mod store;

pub use attempt::{AttemptRunner, AttemptSettings};
pub use evaluator::ProblemEvaluator;
pub use partition::{select, CostBalancedPartition, ModuloPartition, PartitionKind, PartitionStrategy};
pub use record::{Attempt, ProblemResult, ShardResult};
pub use shard::ShardOrchestrator;
pub use store::{read_json, write_json_atomic, ResultStore};
