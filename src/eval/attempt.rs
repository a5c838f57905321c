//! One generate, extract, verify trial.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::record::Attempt;
use crate::error::{EvalError, GenerationError};
use crate::extract::Extractor;
use crate::model::{ModelClient, SamplingConfig};
use crate::problem::{build_prompt, Problem, PromptMode};
use crate::verifier::{Verifier, VerifyError};

/// Per-attempt settings.
#[derive(Debug, Clone)]
pub struct AttemptSettings {
    pub mode: PromptMode,
    pub sampling: SamplingConfig,
    pub generation_timeout: Duration,
    pub verification_timeout: Duration,
    /// Included in staged unit names so concurrent shards never collide.
    pub shard_id: usize,
}

impl AttemptSettings {
    pub fn new(mode: PromptMode) -> Self {
        Self {
            mode,
            sampling: SamplingConfig::for_mode(mode),
            generation_timeout: Duration::from_secs(300),
            verification_timeout: Duration::from_secs(120),
            shard_id: 0,
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn with_verification_timeout(mut self, timeout: Duration) -> Self {
        self.verification_timeout = timeout;
        self
    }

    pub fn with_shard_id(mut self, shard_id: usize) -> Self {
        self.shard_id = shard_id;
        self
    }
}

enum Generated {
    Text(String),
    Failed(String),
}

/// Runs single attempts. Holds no mutable state.
#[derive(Clone)]
pub struct AttemptRunner {
    model: Arc<dyn ModelClient>,
    extractor: Arc<dyn Extractor>,
    verifier: Verifier,
    settings: AttemptSettings,
}

impl AttemptRunner {
    pub fn new(
        model: Arc<dyn ModelClient>,
        extractor: Arc<dyn Extractor>,
        verifier: Verifier,
        settings: AttemptSettings,
    ) -> Self {
        Self {
            model,
            extractor,
            verifier,
            settings,
        }
    }

    pub fn settings(&self) -> &AttemptSettings {
        &self.settings
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    /// Model name for run metadata.
    pub fn model_name(&self) -> String {
        if self.settings.sampling.model.is_empty() {
            self.model.name().to_string()
        } else {
            self.settings.sampling.model.clone()
        }
    }

    /// Runs attempt `attempt_index` for `problem`.
    ///
    /// Every per-attempt failure becomes a recorded outcome. Only
    /// cancellation and an unusable verifier are returned as errors; in both
    /// cases no attempt exists.
    pub async fn run_attempt(&self, problem: &Problem, attempt_index: u32) -> Result<Attempt, EvalError> {
        let registry = self.verifier.sandbox().registry();
        if registry.is_cancelled() {
            return Err(EvalError::Cancelled);
        }

        let started_at = Utc::now();
        let prompt = build_prompt(problem, self.settings.mode);

        let gen_start = Instant::now();
        let generated = tokio::select! {
            res = tokio::time::timeout(
                self.settings.generation_timeout,
                self.model.generate(&prompt, &self.settings.sampling),
            ) => match res {
                Ok(Ok(text)) if !text.trim().is_empty() => Generated::Text(text),
                Ok(Ok(_)) => Generated::Failed(GenerationError::EmptyCompletion.to_string()),
                Ok(Err(e)) => Generated::Failed(e.to_string()),
                Err(_) => Generated::Failed(
                    GenerationError::Timeout(self.settings.generation_timeout).to_string(),
                ),
            },
            _ = registry.cancelled() => {
                info!(problem_id = %problem.id, attempt = attempt_index, "Cancelled during generation");
                return Err(EvalError::Cancelled);
            }
        };
        let generation_time = gen_start.elapsed().as_secs_f64();

        let raw = match generated {
            Generated::Text(text) => text,
            Generated::Failed(detail) => {
                warn!(problem_id = %problem.id, attempt = attempt_index, error = %detail, "Generation failed");
                return Ok(Attempt::generation_failed(
                    attempt_index,
                    started_at,
                    generation_time,
                    detail,
                ));
            }
        };

        let unit = match self.extractor.extract(problem, &raw) {
            Ok(unit) => unit,
            Err(e) => {
                debug!(problem_id = %problem.id, attempt = attempt_index, error = %e, "Extraction failed");
                return Ok(Attempt::extraction_failed(
                    attempt_index,
                    started_at,
                    &raw,
                    generation_time,
                    e.to_string(),
                ));
            }
        };

        let label = format!("s{}_{}_a{}", self.settings.shard_id, problem.id, attempt_index);
        let verify_start = Instant::now();
        let outcome = self
            .verifier
            .verify_with(
                &unit,
                &self.verifier.config().project_root,
                self.settings.verification_timeout,
                &label,
            )
            .await;
        let verification_time = verify_start.elapsed().as_secs_f64();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(VerifyError::Cancelled) => return Err(EvalError::Cancelled),
            Err(e @ VerifyError::Fatal(_)) => return Err(e.into()),
        };

        info!(
            problem_id = %problem.id,
            attempt = attempt_index,
            outcome = %outcome.kind(),
            generation_secs = generation_time,
            verification_secs = verification_time,
            "Attempt finished"
        );
        Ok(Attempt::verified(
            attempt_index,
            started_at,
            &raw,
            &unit,
            generation_time,
            verification_time,
            &outcome,
        ))
    }
}
