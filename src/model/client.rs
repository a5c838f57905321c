//! Model collaborator interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;
use crate::problem::PromptMode;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Default nucleus sampling parameter.
pub const DEFAULT_TOP_P: f64 = 0.95;
/// Default new-token budget without chain of thought.
pub const MAX_NEW_TOKENS_NONCOT: u32 = 2048;
/// Default new-token budget with chain of thought.
pub const MAX_NEW_TOKENS_COT: u32 = 32768;

/// Sampling parameters passed with every generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Model identifier; empty means the client's default.
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

impl SamplingConfig {
    /// Defaults for `mode`.
    pub fn for_mode(mode: PromptMode) -> Self {
        Self {
            model: String::new(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: match mode {
                PromptMode::NonCot => MAX_NEW_TOKENS_NONCOT,
                PromptMode::Cot => MAX_NEW_TOKENS_COT,
            },
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self::for_mode(PromptMode::NonCot)
    }
}

/// Produces candidate text for a prompt.
///
/// Implementations need not bound their own latency; callers wrap
/// `generate` in the generation timeout and drop the future on expiry.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Generates one completion for `prompt`.
    async fn generate(&self, prompt: &str, sampling: &SamplingConfig)
        -> Result<String, GenerationError>;

    /// Name used in logs and run metadata.
    fn name(&self) -> &str {
        "model"
    }
}
