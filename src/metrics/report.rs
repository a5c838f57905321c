//! Timestamped metrics reports.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::summary::MetricsSummary;
use crate::error::StoreError;
use crate::eval::write_json_atomic;
use crate::problem::PromptMode;

/// A summary plus the context it was computed in.
///
/// Only this wrapper carries a timestamp; the summary itself is a pure
/// function of the results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub mode: PromptMode,
    /// False for a single shard's own report.
    pub merged: bool,
    pub shards_merged: Vec<usize>,
    pub summary: MetricsSummary,
}

impl RunReport {
    /// Report for one shard.
    pub fn shard(mode: PromptMode, shard_id: usize, summary: MetricsSummary) -> Self {
        Self {
            generated_at: Utc::now(),
            mode,
            merged: false,
            shards_merged: vec![shard_id],
            summary,
        }
    }

    /// Report over a merged run.
    pub fn merged(mode: PromptMode, shards: Vec<usize>, summary: MetricsSummary) -> Self {
        Self {
            generated_at: Utc::now(),
            mode,
            merged: true,
            shards_merged: shards,
            summary,
        }
    }

    /// `<mode>_<timestamp>.json`, or `<mode>_merged_<timestamp>.json`.
    pub fn file_name(&self) -> String {
        let stamp = self.generated_at.format("%Y%m%d_%H%M%S");
        if self.merged {
            format!("{}_merged_{}.json", self.mode, stamp)
        } else {
            format!("{}_{}.json", self.mode, stamp)
        }
    }
}

/// Writes `report` into `dir` and returns the file path.
pub fn write_report(dir: &Path, report: &RunReport) -> Result<PathBuf, StoreError> {
    let path = dir.join(report.file_name());
    write_json_atomic(&path, report)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::read_json;
    use crate::metrics::summarize;
    use tempfile::TempDir;

    #[test]
    fn test_file_names() {
        let shard = RunReport::shard(PromptMode::NonCot, 2, summarize(&[], &[1], 1));
        assert!(shard.file_name().starts_with("noncot_"));
        assert!(!shard.file_name().contains("merged"));

        let merged = RunReport::merged(PromptMode::Cot, vec![0, 1], summarize(&[], &[1], 1));
        assert!(merged.file_name().starts_with("cot_merged_"));
        assert!(merged.file_name().ends_with(".json"));
    }

    #[test]
    fn test_write_report_round_trip() {
        let dir = TempDir::new().unwrap();
        let report = RunReport::shard(PromptMode::NonCot, 0, summarize(&[], &[1, 8], 4));
        let path = write_report(&dir.path().join("metrics"), &report).unwrap();
        let back: RunReport = read_json(&path).unwrap();
        assert_eq!(back.summary, report.summary);
        assert_eq!(back.shards_merged, vec![0]);
    }
}
