//! Model collaborator: prompt in, candidate text out.

pub mod client;
pub mod openai;

pub use client::{
    ModelClient, SamplingConfig, DEFAULT_TEMPERATURE, DEFAULT_TOP_P, MAX_NEW_TOKENS_COT,
    MAX_NEW_TOKENS_NONCOT,
};
pub use openai::{OpenAiCompatClient, DEFAULT_MODEL};
