//! Metrics over evaluation results.
//!
//! Summaries are derived data: they are recomputed from `ProblemResult`s on
//! demand and never read back as input. Merging validates that shard outputs
//! cover the problem set exactly once before any metric is computed.
//! [`write_run_outputs`] turns a result set into a CSV, an overview and one
//! text file per problem for reading outside the tool.

pub mod export;
pub mod merge;
pub mod report;
pub mod stats;
pub mod summary;

pub use export::{overview_markdown, write_run_outputs, RunOutputs};
pub use merge::{load_shards, merge, MergedResult};
pub use report::{write_report, RunReport};
pub use stats::TimingStats;
pub use summary::{summarize, FailureBreakdown, MetricsSummary, PassAtK, ProblemTiming};
