//! Text generation backends used to turn filled prompts into policies
//!
//! The optimizer never calls a model directly. It hands a filled prompt to a
//! [`TextGenerator`] and scores whatever comes back.
//!
//! This module provides:
//! - OpenRouter HTTP generator with retry and model fallback
//! - Deterministic offline generator for demos and tests
//! - Request/response types matching the OpenAI-compatible API

mod client;
mod offline;
mod types;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{LlmConfig, LlmProvider};
use crate::error::{Error, Result};

pub use client::{OpenRouterGenerator, OpenRouterGeneratorBuilder};
pub use offline::OfflineGenerator;
pub use types::{ChatRequest, ChatResponse, Choice, Message, MessageRole, Usage};

/// Per-call generation settings
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Overrides the generator's default model
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: usize,
    /// Upper bound on the whole call, enforced by the caller
    pub timeout_secs: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from(&LlmConfig::default())
    }
}

impl From<&LlmConfig> for GenerationParams {
    fn from(config: &LlmConfig) -> Self {
        Self {
            model: None,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
        }
    }
}

/// Something that turns a prompt into text
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;

    /// Short backend name for logs
    fn name(&self) -> &str;
}

/// Build the generator selected by `llm.provider`
pub fn build_generator(config: &LlmConfig) -> Result<Arc<dyn TextGenerator>> {
    match config.provider {
        LlmProvider::Offline => Ok(Arc::new(OfflineGenerator::new())),
        LlmProvider::OpenRouter => {
            let api_key = config
                .resolved_api_key()
                .map_err(|e| Error::ConfigurationError(e.to_string()))?
                .ok_or_else(|| {
                    Error::ConfigurationError(
                        "API key is required. Set PROMPTBANDIT_API_KEY or OPENROUTER_API_KEY."
                            .to_string(),
                    )
                })?;
            Ok(Arc::new(OpenRouterGenerator::new(config.clone(), api_key)?))
        }
    }
}
