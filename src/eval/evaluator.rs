//! Per-problem evaluation: N attempts, early stop, checkpointing.

use tracing::{debug, info};

use super::attempt::AttemptRunner;
use super::record::ProblemResult;
use super::store::ResultStore;
use crate::error::EvalError;
use crate::problem::Problem;

/// Runs all attempts for one problem and persists the result.
#[derive(Clone)]
pub struct ProblemEvaluator {
    runner: AttemptRunner,
    store: ResultStore,
    num_samples: u32,
    early_stop_on_success: bool,
    resume: bool,
}

impl ProblemEvaluator {
    pub fn new(runner: AttemptRunner, store: ResultStore, num_samples: u32) -> Self {
        Self {
            runner,
            store,
            num_samples,
            early_stop_on_success: true,
            resume: true,
        }
    }

    pub fn with_early_stop(mut self, enabled: bool) -> Self {
        self.early_stop_on_success = enabled;
        self
    }

    /// Reuse finished artifacts and continue from checkpoints.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn runner(&self) -> &AttemptRunner {
        &self.runner
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    fn matches_run(&self, result: &ProblemResult) -> bool {
        result.mode == self.runner.settings().mode && result.num_samples == self.num_samples
    }

    /// Evaluates `problem`.
    ///
    /// Attempts run with indices `0..num_samples` in order. With early stop,
    /// the first success ends the problem and later slots stay empty. Each
    /// finished attempt is checkpointed; the final artifact replaces the
    /// checkpoint once the problem completes.
    ///
    /// A finished result with the same mode and `num_samples` is reused. One
    /// that was cut short by early stop is continued instead when early stop
    /// is now off.
    pub async fn evaluate(&self, problem: &Problem) -> Result<ProblemResult, EvalError> {
        let mode = self.runner.settings().mode;

        let mut reopened = None;
        if self.resume {
            if let Some(done) = self.store.load_final(&problem.id) {
                if !self.matches_run(&done) {
                    debug!(problem_id = %problem.id, "Finished result is from a different configuration, re-running");
                } else if self.early_stop_on_success || !done.early_stopped {
                    info!(problem_id = %problem.id, passed = done.passed, "Reusing finished result");
                    return Ok(done);
                } else {
                    info!(
                        problem_id = %problem.id,
                        recorded = done.num_attempts,
                        "Finished result stopped early, running the remaining attempts"
                    );
                    reopened = Some(done.reopen());
                }
            }
        }

        let resumed = match reopened {
            Some(result) => Some(result),
            None if self.resume => self
                .store
                .load_partial(&problem.id)
                .filter(|partial| self.matches_run(partial)),
            None => None,
        };
        let mut result = match resumed {
            Some(partial) => {
                info!(
                    problem_id = %problem.id,
                    recorded = partial.num_attempts,
                    "Resuming from checkpoint"
                );
                partial
            }
            None => ProblemResult::new(problem.id.clone(), mode, self.num_samples),
        };

        let mut early_stopped = false;
        let mut next = result.next_attempt_index();
        while next < self.num_samples {
            if self.early_stop_on_success && result.passed {
                early_stopped = true;
                break;
            }
            let attempt = self.runner.run_attempt(problem, next).await?;
            result.push(attempt);
            self.store.save_partial(&result)?;
            next += 1;
        }

        let result = result.complete(early_stopped);
        self.store.save_final(&result)?;
        info!(
            problem_id = %problem.id,
            passed = result.passed,
            attempts = result.num_attempts,
            first_success = ?result.first_success_index,
            "Problem finished"
        );
        Ok(result)
    }
}
