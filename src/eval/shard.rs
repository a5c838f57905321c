//! Shard orchestration: select this shard's problems and evaluate them in order.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::attempt::{AttemptRunner, AttemptSettings};
use super::evaluator::ProblemEvaluator;
use super::partition::select;
use super::record::ShardResult;
use super::store::ResultStore;
use crate::config::EvalConfig;
use crate::error::EvalError;
use crate::extract::Extractor;
use crate::metrics::{summarize, write_report, RunReport};
use crate::model::ModelClient;
use crate::problem::{Problem, ProblemSet};
use crate::sandbox::{ProcessRegistry, ProcessSandbox};
use crate::verifier::{RegexDiagnosticMatcher, Verifier};

const MAX_DIAGNOSTIC_LINES: usize = 10;

/// Drives one shard of an evaluation run.
pub struct ShardOrchestrator {
    config: EvalConfig,
    evaluator: ProblemEvaluator,
}

impl ShardOrchestrator {
    /// Wires sandbox, verifier, attempt runner and store from `config`.
    pub fn new(
        config: EvalConfig,
        model: Arc<dyn ModelClient>,
        extractor: Arc<dyn Extractor>,
        registry: ProcessRegistry,
    ) -> Result<Self, EvalError> {
        config.validate()?;
        let matcher = RegexDiagnosticMatcher::new(&config.diagnostic_patterns, MAX_DIAGNOSTIC_LINES)
            .map_err(|e| EvalError::InvalidConfig(format!("bad diagnostic pattern: {}", e)))?;

        let sandbox = ProcessSandbox::new(config.sandbox_config(), registry);
        let verifier =
            Verifier::new(sandbox, config.verifier_config()).with_matcher(Arc::new(matcher));
        let settings = AttemptSettings::new(config.mode)
            .with_sampling(config.sampling())
            .with_generation_timeout(config.generation_timeout())
            .with_verification_timeout(config.verification_timeout())
            .with_shard_id(config.shard_id);
        let runner = AttemptRunner::new(model, extractor, verifier, settings);
        let evaluator = ProblemEvaluator::new(runner, ResultStore::new(config.shard_dir()), config.num_samples)
            .with_early_stop(config.early_stop_on_success)
            .with_resume(config.resume);

        Ok(Self { config, evaluator })
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn store(&self) -> &ResultStore {
        self.evaluator.store()
    }

    pub fn registry(&self) -> &ProcessRegistry {
        self.evaluator.runner().verifier().sandbox().registry()
    }

    /// This shard's problems in canonical order.
    pub fn assigned<'a>(&self, problems: &'a ProblemSet) -> Vec<&'a Problem> {
        let strategy = self.config.partition.strategy();
        select(
            problems.problems(),
            strategy.as_ref(),
            self.config.shard_count,
            self.config.shard_id,
        )
    }

    /// Evaluates every assigned problem and writes `shard.json`.
    ///
    /// Fails fast if the verifier project is unusable. Cancellation stops
    /// between or inside attempts; finished problems stay on disk and no
    /// shard artifact is written.
    pub async fn run_shard(&self, problems: &ProblemSet) -> Result<ShardResult, EvalError> {
        let verifier = self.evaluator.runner().verifier();
        verifier.check_project()?;
        self.store().ensure_dirs()?;

        let started_at = Utc::now();
        let assigned = self.assigned(problems);
        info!(
            shard_id = self.config.shard_id,
            shard_count = self.config.shard_count,
            mode = %self.config.mode,
            partition = %self.config.partition,
            assigned = assigned.len(),
            total = problems.len(),
            output = %self.store().root().display(),
            "Starting shard"
        );
        if assigned.is_empty() {
            warn!(shard_id = self.config.shard_id, "No problems assigned to this shard");
        }

        let mut results = Vec::with_capacity(assigned.len());
        let mut solved = 0usize;
        for (i, problem) in assigned.iter().enumerate() {
            if self.registry().is_cancelled() {
                return Err(EvalError::Cancelled);
            }
            let result = self.evaluator.evaluate(problem).await?;
            if result.passed {
                solved += 1;
            }
            info!(
                progress = format!("{}/{}", i + 1, assigned.len()),
                solved,
                problem_id = %problem.id,
                "Shard progress"
            );
            results.push(result);
        }

        let shard = ShardResult {
            run_id: Uuid::new_v4().to_string(),
            shard_id: self.config.shard_id,
            shard_count: self.config.shard_count,
            mode: self.config.mode,
            partition: self.config.partition,
            problem_set_fingerprint: problems.fingerprint(),
            total_problems: problems.len(),
            assigned_ids: assigned.iter().map(|p| p.id.clone()).collect(),
            results,
            num_samples: self.config.num_samples,
            early_stop_on_success: self.config.early_stop_on_success,
            model: self.evaluator.runner().model_name(),
            started_at,
            completed_at: Utc::now(),
        };
        self.store().save_shard(&shard)?;

        let summary = summarize(&shard.results, &self.config.k_values, self.config.num_samples);
        let report = RunReport::shard(self.config.mode, shard.shard_id, summary);
        let path = write_report(&self.store().metrics_dir(), &report)?;
        info!(
            shard_id = shard.shard_id,
            solved,
            problems = shard.results.len(),
            report = %path.display(),
            "Shard complete"
        );
        Ok(shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::extract::LeanBlockExtractor;
    use crate::model::SamplingConfig;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NeverCalled;

    #[async_trait]
    impl ModelClient for NeverCalled {
        async fn generate(&self, _p: &str, _s: &SamplingConfig) -> Result<String, GenerationError> {
            Err(GenerationError::EmptyCompletion)
        }
    }

    fn problem_set(n: usize) -> ProblemSet {
        ProblemSet::new((0..n).map(|i| Problem::new(format!("p{}", i), "")).collect()).unwrap()
    }

    fn orchestrator(config: EvalConfig) -> Result<ShardOrchestrator, EvalError> {
        ShardOrchestrator::new(
            config,
            Arc::new(NeverCalled),
            Arc::new(LeanBlockExtractor::new()),
            ProcessRegistry::new(),
        )
    }

    #[test]
    fn test_assigned_follows_partition() {
        let orch = orchestrator(EvalConfig::new().with_shard(1, 3)).unwrap();
        let ids: Vec<_> = orch.assigned(&problem_set(7)).iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["p1", "p4"]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            orchestrator(EvalConfig::new().with_shard(3, 3)),
            Err(EvalError::InvalidConfig(_))
        ));
        let mut config = EvalConfig::new();
        config.diagnostic_patterns = vec!["(".into()];
        assert!(matches!(orchestrator(config), Err(EvalError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_missing_project_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = EvalConfig::new()
            .with_output_dir(dir.path().join("out"))
            .with_verifier_project_root(dir.path().join("no-project"));
        let orch = orchestrator(config).unwrap();
        let err = orch.run_shard(&problem_set(2)).await.unwrap_err();
        assert!(matches!(err, EvalError::SandboxFatal(_)));
        assert!(!orch.store().shard_file().exists());
    }
}
