//! Merging shard outputs into one result set.
//!
//! A merge is accepted only when the shards form a disjoint cover of the
//! problem set they were cut from. Shard directories are read, never written.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CoverageError;
use crate::eval::{select, PartitionKind, ProblemResult, ResultStore, ShardResult};
use crate::problem::{ProblemSet, PromptMode};

/// Union of every shard's results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    pub mode: PromptMode,
    pub shard_count: usize,
    pub partition: PartitionKind,
    pub problem_set_fingerprint: String,
    pub num_samples: u32,
    /// Shard ids merged, ascending.
    pub shards: Vec<usize>,
    /// Sorted by problem id.
    pub results: Vec<ProblemResult>,
}

/// Reads `shard_*/shard.json` under `mode_dir`, ordered by shard id.
///
/// Shard directories without a `shard.json` are skipped with a warning; the
/// coverage check in [`merge`] reports them as missing.
pub fn load_shards(mode_dir: &Path) -> Result<Vec<ShardResult>, CoverageError> {
    let entries = std::fs::read_dir(mode_dir)
        .map_err(|e| crate::error::StoreError::io(mode_dir, e))?;

    let mut shards = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| crate::error::StoreError::io(mode_dir, e))?;
        let path = entry.path();
        let is_shard_dir = path.is_dir()
            && entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("shard_"))
                .is_some_and(|n| n.parse::<usize>().is_ok());
        if !is_shard_dir {
            continue;
        }
        let store = ResultStore::new(&path);
        if !store.shard_file().exists() {
            warn!(dir = %path.display(), "Shard directory has no shard.json, skipping");
            continue;
        }
        let shard = store.load_shard()?;
        debug!(shard_id = shard.shard_id, results = shard.results.len(), "Loaded shard");
        shards.push(shard);
    }
    shards.sort_by_key(|s| s.shard_id);
    Ok(shards)
}

/// Merges shard results, validating that they cover the problem set exactly
/// once.
///
/// With `expected`, the merged ids must equal the expected set, and shards
/// cut with a positional strategy must hold exactly the problems that
/// strategy assigns them. Merging the same inputs always yields the same
/// output.
pub fn merge(
    mut shards: Vec<ShardResult>,
    expected: Option<&ProblemSet>,
) -> Result<MergedResult, CoverageError> {
    if shards.is_empty() {
        return Err(CoverageError::NoShards);
    }
    shards.sort_by_key(|s| s.shard_id);

    let reference = &shards[0];
    let (mode, shard_count, partition, num_samples) = (
        reference.mode,
        reference.shard_count,
        reference.partition,
        reference.num_samples,
    );
    let fingerprint = reference.problem_set_fingerprint.clone();
    let total_problems = reference.total_problems;

    // ------------------------------------------------------------------------
    // Shard-level consistency
    // ------------------------------------------------------------------------

    let mut seen_shards = BTreeSet::new();
    for shard in &shards {
        if shard.shard_count != shard_count {
            return Err(CoverageError::ShardCountMismatch {
                shard_id: shard.shard_id,
                expected: shard_count,
                found: shard.shard_count,
            });
        }
        if shard.shard_id >= shard_count {
            return Err(CoverageError::ShardOutOfRange {
                shard_id: shard.shard_id,
                shard_count,
            });
        }
        if shard.mode != mode {
            return Err(CoverageError::ModeMismatch {
                shard_id: shard.shard_id,
                expected: mode.to_string(),
                found: shard.mode.to_string(),
            });
        }
        if shard.num_samples != num_samples {
            return Err(CoverageError::NumSamplesMismatch {
                shard_id: shard.shard_id,
                expected: num_samples,
                found: shard.num_samples,
            });
        }
        if shard.problem_set_fingerprint != fingerprint {
            return Err(CoverageError::FingerprintMismatch {
                shard_id: shard.shard_id,
                expected: fingerprint.clone(),
                found: shard.problem_set_fingerprint.clone(),
            });
        }
        if shard.partition != partition {
            return Err(CoverageError::PartitionMismatch {
                shard_id: shard.shard_id,
                strategy: partition.to_string(),
            });
        }
        if !seen_shards.insert(shard.shard_id) {
            return Err(CoverageError::DuplicateShard(shard.shard_id));
        }
    }
    let missing_shards: Vec<usize> = (0..shard_count).filter(|id| !seen_shards.contains(id)).collect();
    if !missing_shards.is_empty() {
        return Err(CoverageError::MissingShards(missing_shards));
    }

    // ------------------------------------------------------------------------
    // Problem-level coverage
    // ------------------------------------------------------------------------

    let mut owner: HashMap<&str, usize> = HashMap::new();
    for shard in &shards {
        let assigned: BTreeSet<&str> = shard.assigned_ids.iter().map(String::as_str).collect();
        let mut reported = BTreeSet::new();
        for result in &shard.results {
            let id = result.problem_id.as_str();
            if let Some(&first) = owner.get(id) {
                return Err(CoverageError::DuplicateProblem {
                    problem_id: id.to_string(),
                    first,
                    second: shard.shard_id,
                });
            }
            owner.insert(id, shard.shard_id);
            reported.insert(id);
        }

        let unassigned: Vec<String> = reported.difference(&assigned).map(|s| s.to_string()).collect();
        if !unassigned.is_empty() {
            return Err(CoverageError::UnexpectedProblems(unassigned));
        }
        let missing = assigned.difference(&reported).count();
        if missing > 0 {
            return Err(CoverageError::IncompleteShard {
                shard_id: shard.shard_id,
                missing,
            });
        }
    }

    if let Some(expected) = expected {
        check_expected(&shards, &owner, expected, partition, &fingerprint)?;
    } else if owner.len() != total_problems {
        return Err(CoverageError::ProblemCountMismatch {
            expected: total_problems,
            found: owner.len(),
        });
    }

    let shard_ids = shards.iter().map(|s| s.shard_id).collect();
    let mut results: Vec<ProblemResult> = shards.into_iter().flat_map(|s| s.results).collect();
    for result in &mut results {
        result.finalize();
    }
    results.sort_by(|a, b| a.problem_id.cmp(&b.problem_id));

    Ok(MergedResult {
        mode,
        shard_count,
        partition,
        problem_set_fingerprint: fingerprint,
        num_samples,
        shards: shard_ids,
        results,
    })
}

fn check_expected(
    shards: &[ShardResult],
    owner: &HashMap<&str, usize>,
    expected: &ProblemSet,
    partition: PartitionKind,
    fingerprint: &str,
) -> Result<(), CoverageError> {
    let expected_fingerprint = expected.fingerprint();
    if fingerprint != expected_fingerprint {
        return Err(CoverageError::FingerprintMismatch {
            shard_id: shards[0].shard_id,
            expected: expected_fingerprint,
            found: fingerprint.to_string(),
        });
    }

    let expected_ids: BTreeSet<&str> = expected.problems().iter().map(|p| p.id.as_str()).collect();
    let mut unexpected: Vec<String> = owner
        .keys()
        .filter(|id| !expected_ids.contains(*id))
        .map(|id| id.to_string())
        .collect();
    if !unexpected.is_empty() {
        unexpected.sort();
        return Err(CoverageError::UnexpectedProblems(unexpected));
    }
    let missing: Vec<String> = expected_ids
        .iter()
        .filter(|id| !owner.contains_key(*id))
        .map(|id| id.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(CoverageError::MissingProblems(missing));
    }

    // Cost-balanced assignments depend on cost hints that may have changed
    // since the run; only positional partitions are recomputed.
    if partition.is_positional() {
        let strategy = partition.strategy();
        for shard in shards {
            let recomputed: Vec<&str> = select(
                expected.problems(),
                strategy.as_ref(),
                shard.shard_count,
                shard.shard_id,
            )
            .into_iter()
            .map(|p| p.id.as_str())
            .collect();
            let assigned: Vec<&str> = shard.assigned_ids.iter().map(String::as_str).collect();
            if recomputed != assigned {
                return Err(CoverageError::PartitionMismatch {
                    shard_id: shard.shard_id,
                    strategy: partition.to_string(),
                });
            }
        }
    }
    Ok(())
}
