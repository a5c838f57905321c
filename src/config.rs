//! Evaluation configuration.
//!
//! Values come from built-in defaults, optionally overridden by a YAML file,
//! then by CLI flags and environment variables (applied in `cli::commands`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EvalError;
use crate::eval::PartitionKind;
use crate::model::SamplingConfig;
use crate::problem::PromptMode;
use crate::sandbox::SandboxConfig;
use crate::verifier::{VerifierCommand, VerifierConfig, DEFAULT_DIAGNOSTIC_PATTERNS, DEFAULT_REJECT_MARKERS};

/// Default Pass@k values.
pub const DEFAULT_K_VALUES: &[u32] = &[1, 8, 32];

/// Configuration for one shard run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub mode: PromptMode,
    /// Attempts planned per problem.
    pub num_samples: u32,
    pub k_values: Vec<u32>,
    pub early_stop_on_success: bool,
    pub shard_count: usize,
    pub shard_id: usize,
    pub partition: PartitionKind,
    /// Root of all shard outputs; a shard writes under `<output_dir>/<mode>/shard_<id>`.
    pub output_dir: PathBuf,
    pub problems_dir: PathBuf,
    /// JSON object of problem id to expected seconds per attempt.
    pub costs_file: Option<PathBuf>,
    /// Reuse finished problem artifacts and partial checkpoints.
    pub resume: bool,

    pub verifier_project_root: PathBuf,
    pub verifier_command: VerifierCommand,
    pub verification_timeout_secs: u64,
    pub require_manifest: bool,
    pub diagnostic_patterns: Vec<String>,
    pub reject_markers: Vec<String>,

    pub generation_timeout_secs: u64,
    /// Model name; empty means the client's default.
    pub model: String,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,

    pub grace_period_secs: u64,
    pub max_output_bytes: usize,
}

impl EvalConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            mode: PromptMode::NonCot,
            num_samples: 32,
            k_values: DEFAULT_K_VALUES.to_vec(),
            early_stop_on_success: true,
            shard_count: 1,
            shard_id: 0,
            partition: PartitionKind::Modulo,
            output_dir: PathBuf::from("./results"),
            problems_dir: PathBuf::from("./problems"),
            costs_file: None,
            resume: true,
            verifier_project_root: PathBuf::from("."),
            verifier_command: VerifierCommand::default(),
            verification_timeout_secs: 120,
            require_manifest: true,
            diagnostic_patterns: DEFAULT_DIAGNOSTIC_PATTERNS.iter().map(|s| s.to_string()).collect(),
            reject_markers: DEFAULT_REJECT_MARKERS.iter().map(|s| s.to_string()).collect(),
            generation_timeout_secs: 300,
            model: String::new(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            grace_period_secs: 5,
            max_output_bytes: 1024 * 1024,
        }
    }

    /// Loads a YAML file; absent keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, EvalError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EvalError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&text).map_err(|e| {
            EvalError::InvalidConfig(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Sets the prompt mode.
    pub fn with_mode(mut self, mode: PromptMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the attempts planned per problem.
    pub fn with_num_samples(mut self, n: u32) -> Self {
        self.num_samples = n;
        self
    }

    /// Sets the Pass@k values to report.
    pub fn with_k_values(mut self, k_values: Vec<u32>) -> Self {
        self.k_values = k_values;
        self
    }

    /// Enables or disables stopping a problem at its first success.
    pub fn with_early_stop(mut self, enabled: bool) -> Self {
        self.early_stop_on_success = enabled;
        self
    }

    /// Sets `shard_count` and `shard_id` together.
    pub fn with_shard(mut self, shard_id: usize, shard_count: usize) -> Self {
        self.shard_id = shard_id;
        self.shard_count = shard_count;
        self
    }

    /// Sets the partition strategy.
    pub fn with_partition(mut self, partition: PartitionKind) -> Self {
        self.partition = partition;
        self
    }

    /// Sets the output root.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Sets the problem statement directory.
    pub fn with_problems_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.problems_dir = dir.into();
        self
    }

    /// Enables or disables reuse of earlier artifacts.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Sets the project the verifier runs in.
    pub fn with_verifier_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.verifier_project_root = root.into();
        self
    }

    /// Sets the verifier command template.
    pub fn with_verifier_command(mut self, command: VerifierCommand) -> Self {
        self.verifier_command = command;
        self
    }

    /// Requires a build manifest in the project root.
    pub fn with_require_manifest(mut self, require: bool) -> Self {
        self.require_manifest = require;
        self
    }

    /// Sets the per-run verifier timeout (whole seconds).
    pub fn with_verification_timeout(mut self, timeout: Duration) -> Self {
        self.verification_timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the per-call model timeout (whole seconds).
    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the SIGTERM to SIGKILL grace period (whole seconds).
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_secs = grace.as_secs();
        self
    }

    /// Verifier timeout as a `Duration`.
    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }

    /// Model timeout as a `Duration`.
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    /// Grace period as a `Duration`.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Rejects configurations no shard could run with.
    pub fn validate(&self) -> Result<(), EvalError> {
        if self.shard_count == 0 {
            return Err(EvalError::InvalidConfig("shard_count must be at least 1".into()));
        }
        if self.shard_id >= self.shard_count {
            return Err(EvalError::InvalidConfig(format!(
                "shard_id {} is out of range for shard_count {}",
                self.shard_id, self.shard_count
            )));
        }
        if self.num_samples == 0 {
            return Err(EvalError::InvalidConfig("num_samples must be at least 1".into()));
        }
        if self.verification_timeout_secs == 0 {
            return Err(EvalError::InvalidConfig("verification timeout must be positive".into()));
        }
        if self.generation_timeout_secs == 0 {
            return Err(EvalError::InvalidConfig("generation timeout must be positive".into()));
        }
        if self.k_values.contains(&0) {
            return Err(EvalError::InvalidConfig("k values must be positive".into()));
        }
        if self.verifier_command.program.trim().is_empty() {
            return Err(EvalError::InvalidConfig("verifier command is empty".into()));
        }
        if self.max_output_bytes == 0 {
            return Err(EvalError::InvalidConfig("max_output_bytes must be positive".into()));
        }
        Ok(())
    }

    /// Sampling parameters: mode defaults with configured overrides.
    pub fn sampling(&self) -> SamplingConfig {
        let mut sampling = SamplingConfig::for_mode(self.mode).with_model(self.model.clone());
        if let Some(t) = self.temperature {
            sampling = sampling.with_temperature(t);
        }
        if let Some(p) = self.top_p {
            sampling = sampling.with_top_p(p);
        }
        if let Some(m) = self.max_tokens {
            sampling = sampling.with_max_tokens(m);
        }
        sampling
    }

    /// Sandbox settings for this run.
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig::new()
            .with_grace_period(self.grace_period())
            .with_max_output_bytes(self.max_output_bytes)
    }

    /// Verifier settings for this run.
    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig::new(self.verifier_project_root.clone())
            .with_command(self.verifier_command.clone())
            .with_timeout(self.verification_timeout())
            .with_reject_markers(self.reject_markers.clone())
            .with_require_manifest(self.require_manifest)
    }

    /// `<output_dir>/<mode>`, the parent of every shard directory.
    pub fn mode_dir(&self) -> PathBuf {
        self.output_dir.join(self.mode.label())
    }

    /// This shard's output directory.
    pub fn shard_dir(&self) -> PathBuf {
        self.mode_dir().join(format!("shard_{}", self.shard_id))
    }
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EvalConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_samples, 32);
        assert_eq!(config.k_values, vec![1, 8, 32]);
        assert_eq!(config.verification_timeout(), Duration::from_secs(120));
        assert_eq!(config.generation_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_bad_shards() {
        let err = EvalConfig::new().with_shard(2, 2).validate().unwrap_err();
        assert!(err.to_string().contains("shard_id 2"));
        assert!(EvalConfig::new().with_shard(0, 0).validate().is_err());
        assert!(EvalConfig::new().with_num_samples(0).validate().is_err());
        assert!(EvalConfig::new().with_k_values(vec![0, 1]).validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = EvalConfig::new()
            .with_early_stop(false)
            .with_resume(false)
            .with_require_manifest(false)
            .with_verifier_project_root("/lean")
            .with_verification_timeout(Duration::from_millis(2500))
            .with_generation_timeout(Duration::from_secs(30))
            .with_grace_period(Duration::from_secs(2));
        assert!(!config.early_stop_on_success);
        assert!(!config.resume);
        // Timeouts are kept in whole seconds.
        assert_eq!(config.verification_timeout(), Duration::from_secs(2));
        assert_eq!(config.generation_timeout(), Duration::from_secs(30));

        let verifier = config.verifier_config();
        assert_eq!(verifier.project_root, PathBuf::from("/lean"));
        assert_eq!(verifier.timeout, Duration::from_secs(2));
        assert!(!verifier.require_manifest);
        assert_eq!(config.sandbox_config().grace_period, Duration::from_secs(2));
    }

    #[test]
    fn test_shard_dir_layout() {
        let config = EvalConfig::new()
            .with_output_dir("/out")
            .with_mode(PromptMode::Cot)
            .with_shard(3, 8);
        assert_eq!(config.shard_dir(), PathBuf::from("/out/cot/shard_3"));
    }

    #[test]
    fn test_sampling_overrides() {
        let mut config = EvalConfig::new().with_mode(PromptMode::Cot);
        assert_eq!(config.sampling().max_tokens, 32768);
        config.max_tokens = Some(512);
        config.temperature = Some(1.0);
        let s = config.sampling();
        assert_eq!(s.max_tokens, 512);
        assert_eq!(s.temperature, 1.0);
        assert_eq!(s.top_p, 0.95);
    }

    #[test]
    fn test_from_yaml_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("eval.yaml");
        std::fs::write(
            &path,
            "mode: cot\nnum_samples: 4\nshard_count: 2\nshard_id: 1\npartition: cost_balanced\n\
             verifier_command:\n  program: lake\n  args: [env, lean, \"{input}\"]\n",
        )
        .unwrap();
        let config = EvalConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.mode, PromptMode::Cot);
        assert_eq!(config.num_samples, 4);
        assert_eq!(config.shard_id, 1);
        assert_eq!(config.partition, PartitionKind::CostBalanced);
        assert_eq!(config.verification_timeout_secs, 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "num_samples: [").unwrap();
        assert!(matches!(
            EvalConfig::from_yaml_file(&path),
            Err(EvalError::InvalidConfig(_))
        ));
    }
}
