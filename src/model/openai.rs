//! OpenAI-compatible chat completions client.
//!
//! Works against any server exposing `POST {api_base}/chat/completions`
//! (vLLM, LiteLLM, OpenRouter, text-generation-inference in OpenAI mode).

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::client::{ModelClient, SamplingConfig};
use crate::error::GenerationError;

/// Default model when neither the request nor the environment names one.
pub const DEFAULT_MODEL: &str = "deepseek-ai/DeepSeek-Prover-V2-7B";

/// Client for OpenAI-compatible inference servers.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    http_client: Client,
}

impl OpenAiCompatClient {
    /// Creates a client with explicit configuration.
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Result<Self, GenerationError> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GenerationError::RequestFailed(e.to_string()))?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
            http_client,
        })
    }

    /// Creates a client from the environment.
    ///
    /// Reads `MODEL_API_BASE` (required), `MODEL_API_KEY` and `MODEL_NAME`.
    pub fn from_env() -> Result<Self, GenerationError> {
        let api_base = env::var("MODEL_API_BASE").map_err(|_| GenerationError::MissingApiBase)?;
        let api_key = env::var("MODEL_API_KEY").ok();
        let model = env::var("MODEL_NAME").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(api_base, api_key, model)
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn generate(
        &self,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<String, GenerationError> {
        let model = if sampling.model.is_empty() {
            self.default_model.as_str()
        } else {
            sampling.model.as_str()
        };

        let body = ApiRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            max_tokens: sampling.max_tokens,
        };

        let url = format!("{}/chat/completions", self.api_base);
        let mut request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&text)
                .map(|r| r.error.message)
                .unwrap_or(text);
            return Err(GenerationError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::ParseError(format!("Failed to parse API response: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(GenerationError::EmptyCompletion)?;
        debug!(model, finish_reason = ?choice.finish_reason, "Generation finished");

        match choice.message.content {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(GenerationError::EmptyCompletion),
        }
    }

    fn name(&self) -> &str {
        &self.default_model
    }
}
