//! On-disk layout of one shard's outputs.
//!
//! ```text
//! <shard_dir>/
//!   proofs/<stem>.json                finished ProblemResult
//!   proofs/<stem>.partial.json        in-progress checkpoint
//!   shard.json                        ShardResult, written once at the end
//!   metrics/<mode>_<timestamp>.json   RunReport for this shard
//! ```
//!
//! `<stem>` is the sanitized problem id plus a short hash of the raw id.
//!
//! Every write goes to a temp file in the target directory and is renamed
//! into place, so a crash never leaves a half-written artifact.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::record::{ProblemResult, ShardResult};
use crate::error::StoreError;

pub const PROOFS_DIR: &str = "proofs";
pub const METRICS_DIR: &str = "metrics";
pub const SHARD_FILE: &str = "shard.json";

/// Writes `value` as pretty JSON via temp file and rename.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::json(path, e))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp.")
        .suffix(".json")
        .tempfile_in(parent)
        .map_err(|e| StoreError::io(parent, e))?;
    tmp.write_all(&bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Reads JSON from `path`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let text = std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| StoreError::json(path, e))
}

/// Bytes of the readable part of a file stem.
const MAX_STEM_BYTES: usize = 96;

/// File stem for a problem id: the id with path separators replaced, capped
/// in length, plus a short hash of the raw id so distinct ids never share a
/// file.
pub(crate) fn file_stem(problem_id: &str) -> String {
    let mut readable = String::new();
    for c in problem_id.chars() {
        if readable.len() + c.len_utf8() > MAX_STEM_BYTES {
            break;
        }
        readable.push(match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        });
    }
    let digest = Sha256::digest(problem_id.as_bytes());
    format!("{}-{}", readable, hex::encode(&digest[..4]))
}

/// Result store rooted at one shard directory.
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn proofs_dir(&self) -> PathBuf {
        self.root.join(PROOFS_DIR)
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.root.join(METRICS_DIR)
    }

    pub fn shard_file(&self) -> PathBuf {
        self.root.join(SHARD_FILE)
    }

    pub fn final_path(&self, problem_id: &str) -> PathBuf {
        self.proofs_dir().join(format!("{}.json", file_stem(problem_id)))
    }

    pub fn partial_path(&self, problem_id: &str) -> PathBuf {
        self.proofs_dir()
            .join(format!("{}.partial.json", file_stem(problem_id)))
    }

    /// Creates the shard directories.
    pub fn ensure_dirs(&self) -> Result<(), StoreError> {
        for dir in [self.proofs_dir(), self.metrics_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Finished result for `problem_id`, if one exists and parses.
    ///
    /// An unreadable artifact is logged and treated as absent so the problem
    /// is re-run rather than aborting the shard.
    pub fn load_final(&self, problem_id: &str) -> Option<ProblemResult> {
        self.load_checked(&self.final_path(problem_id), problem_id)
            .filter(ProblemResult::is_complete)
    }

    /// In-progress checkpoint for `problem_id`, if any.
    pub fn load_partial(&self, problem_id: &str) -> Option<ProblemResult> {
        self.load_checked(&self.partial_path(problem_id), problem_id)
    }

    fn load_checked(&self, path: &Path, problem_id: &str) -> Option<ProblemResult> {
        if !path.exists() {
            return None;
        }
        match read_json::<ProblemResult>(path) {
            Ok(mut result) if result.problem_id == problem_id => {
                result.finalize();
                Some(result)
            }
            Ok(result) => {
                warn!(
                    path = %path.display(),
                    expected = problem_id,
                    found = %result.problem_id,
                    "Ignoring artifact for a different problem"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable artifact");
                None
            }
        }
    }

    /// Every finished result under `proofs/`, sorted by problem id.
    /// Checkpoints and unreadable files are skipped.
    pub fn completed_results(&self) -> Result<Vec<ProblemResult>, StoreError> {
        let dir = self.proofs_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") || name.ends_with(".partial.json") || name.starts_with(".tmp.") {
                continue;
            }
            match read_json::<ProblemResult>(&path) {
                Ok(mut result) if result.is_complete() => {
                    result.finalize();
                    results.push(result);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable result"),
            }
        }
        results.sort_by(|a, b| a.problem_id.cmp(&b.problem_id));
        Ok(results)
    }

    /// Checkpoints an in-progress result.
    pub fn save_partial(&self, result: &ProblemResult) -> Result<(), StoreError> {
        write_json_atomic(&self.partial_path(&result.problem_id), result)
    }

    /// Writes the finished result and drops its checkpoint.
    pub fn save_final(&self, result: &ProblemResult) -> Result<(), StoreError> {
        let path = self.final_path(&result.problem_id);
        write_json_atomic(&path, result)?;
        let partial = self.partial_path(&result.problem_id);
        match std::fs::remove_file(&partial) {
            Ok(()) => debug!(path = %partial.display(), "Removed checkpoint"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&partial, e)),
        }
        Ok(())
    }

    pub fn save_shard(&self, shard: &ShardResult) -> Result<(), StoreError> {
        write_json_atomic(&self.shard_file(), shard)
    }

    pub fn load_shard(&self) -> Result<ShardResult, StoreError> {
        let mut shard: ShardResult = read_json(&self.shard_file())?;
        for result in &mut shard.results {
            result.finalize();
        }
        Ok(shard)
    }
}
