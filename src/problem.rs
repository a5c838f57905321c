//! Problem sets and prompt construction.
//!
//! A problem set is a directory of `.lean` files, one theorem statement per
//! file. Problems are ordered by id so that every shard sees the same
//! positions, and the ordered id list is fingerprinted so a merge can tell
//! whether all shards evaluated the same set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::EvalError;

/// Optional descriptive data attached to a problem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemMetadata {
    /// Benchmark the problem came from (e.g. `minif2f`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    /// File the statement was loaded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Expected cost of one attempt, used by cost-balanced partitioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost_secs: Option<f64>,
}

/// One theorem to prove. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    /// Verifier source with the goal and a placeholder proof.
    pub statement: String,
    #[serde(default)]
    pub metadata: ProblemMetadata,
}

impl Problem {
    pub fn new(id: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            statement: statement.into(),
            metadata: ProblemMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: ProblemMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Ordered, duplicate-free collection of problems.
#[derive(Debug, Clone, Default)]
pub struct ProblemSet {
    problems: Vec<Problem>,
}

impl ProblemSet {
    /// Builds a set from problems already in their canonical order.
    pub fn new(problems: Vec<Problem>) -> Result<Self, EvalError> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (i, p) in problems.iter().enumerate() {
            if p.id.is_empty() {
                return Err(EvalError::ProblemSet(format!("problem at position {} has an empty id", i)));
            }
            if let Some(first) = seen.insert(p.id.as_str(), i) {
                return Err(EvalError::ProblemSet(format!(
                    "duplicate problem id '{}' at positions {} and {}",
                    p.id, first, i
                )));
            }
        }
        Ok(Self { problems })
    }

    /// Loads every `*.lean` file under `dir`, ordered by id.
    pub fn load_dir(dir: &Path) -> Result<Self, EvalError> {
        if !dir.is_dir() {
            return Err(EvalError::ProblemSet(format!(
                "problems directory {} does not exist",
                dir.display()
            )));
        }
        let source = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string());

        let mut problems = Vec::new();
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry.map_err(|e| EvalError::ProblemSet(e.to_string()))?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().is_none_or(|e| e != "lean") {
                continue;
            }
            let Some(id) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            let statement = std::fs::read_to_string(path).map_err(|e| {
                EvalError::ProblemSet(format!("failed to read {}: {}", path.display(), e))
            })?;
            problems.push(Problem {
                id,
                statement,
                metadata: ProblemMetadata {
                    source: source.clone(),
                    path: Some(path.to_path_buf()),
                    ..Default::default()
                },
            });
        }
        problems.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.metadata.path.cmp(&b.metadata.path)));
        debug!(dir = %dir.display(), count = problems.len(), "Loaded problem files");

        let set = Self::new(problems)?;
        if set.is_empty() {
            return Err(EvalError::ProblemSet(format!(
                "no .lean files found under {}",
                dir.display()
            )));
        }
        info!(count = set.len(), fingerprint = %set.fingerprint(), "Problem set loaded");
        Ok(set)
    }

    /// Attaches per-problem cost estimates, in seconds, keyed by id.
    /// Unknown ids are ignored.
    pub fn with_costs(mut self, costs: &HashMap<String, f64>) -> Self {
        for p in &mut self.problems {
            if let Some(&cost) = costs.get(&p.id) {
                if cost.is_finite() && cost >= 0.0 {
                    p.metadata.estimated_cost_secs = Some(cost);
                }
            }
        }
        self
    }

    /// Problems in canonical order.
    pub fn problems(&self) -> &[Problem] {
        &self.problems
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Problem> {
        self.problems.iter().find(|p| p.id == id)
    }

    /// Ids in canonical order.
    pub fn ids(&self) -> Vec<String> {
        self.problems.iter().map(|p| p.id.clone()).collect()
    }

    /// SHA-256 over the ordered ids.
    pub fn fingerprint(&self) -> String {
        fingerprint_ids(self.problems.iter().map(|p| p.id.as_str()))
    }
}

/// SHA-256 (hex) over ids, newline separated.
pub fn fingerprint_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Prompting style; also the evaluation mode label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PromptMode {
    /// Ask for Lean code directly.
    #[default]
    #[serde(rename = "noncot")]
    NonCot,
    /// Ask for reasoning first, then Lean code.
    #[serde(rename = "cot")]
    Cot,
}

impl PromptMode {
    pub fn label(&self) -> &'static str {
        match self {
            PromptMode::NonCot => "noncot",
            PromptMode::Cot => "cot",
        }
    }
}

impl std::fmt::Display for PromptMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for PromptMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "noncot" | "non-cot" | "direct" => Ok(PromptMode::NonCot),
            "cot" | "chain-of-thought" => Ok(PromptMode::Cot),
            other => Err(format!("Unknown prompt mode: {}", other)),
        }
    }
}

/// Builds the model prompt for `problem`.
pub fn build_prompt(problem: &Problem, mode: PromptMode) -> String {
    let mut prompt = format!(
        "Complete the following Lean 4 code:\n```lean4\n{}\n```",
        problem.statement
    );
    if mode == PromptMode::Cot {
        prompt.push_str(
            "\nFirst, analyze the problem and explain your reasoning step-by-step in natural language. \
             Then provide the complete Lean 4 proof code.",
        );
    }
    prompt
}
