//! OpenRouter text generator
//!
//! Async HTTP client for the OpenRouter chat completions endpoint with:
//! - Model fallback on rate limits and model-specific failures
//! - Rate limit handling with exponential backoff

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client as HttpClient;
use tracing::{debug, error, info, warn};

use crate::config::LlmConfig;
use crate::error::{Error, Result};

use super::types::{ChatRequest, ChatResponse, Message};
use super::{GenerationParams, TextGenerator};

/// OpenRouter API base URL
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Maximum number of retry attempts for rate-limited requests
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (in milliseconds)
const BACKOFF_BASE_MS: u64 = 1000;

const SYSTEM_PROMPT: &str =
    "You write Open Policy Agent Rego policies. Reply with policy source only.";

/// OpenRouter-backed [`TextGenerator`]
#[derive(Clone)]
pub struct OpenRouterGenerator {
    http_client: HttpClient,
    config: LlmConfig,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for OpenRouterGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterGenerator")
            .field("base_url", &self.base_url)
            .field("default_model", &self.config.default_model)
            .finish()
    }
}

/// Builder for creating an OpenRouterGenerator
#[derive(Default)]
pub struct OpenRouterGeneratorBuilder {
    config: Option<LlmConfig>,
    api_key: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

impl OpenRouterGeneratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the base URL (defaults to OpenRouter)
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the HTTP request timeout
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn build(self) -> Result<OpenRouterGenerator> {
        let config = self.config.unwrap_or_default();
        let api_key = self
            .api_key
            .ok_or_else(|| Error::ConfigurationError("API key is required".to_string()))?;

        let timeout_secs = self.timeout_secs.unwrap_or(config.timeout_secs);

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(Error::NetworkError)?;

        Ok(OpenRouterGenerator {
            http_client,
            config,
            api_key,
            base_url: self
                .base_url
                .unwrap_or_else(|| OPENROUTER_BASE_URL.to_string()),
        })
    }
}

impl OpenRouterGenerator {
    pub fn new(config: LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        OpenRouterGeneratorBuilder::new()
            .config(config)
            .api_key(api_key)
            .build()
    }

    pub fn builder() -> OpenRouterGeneratorBuilder {
        OpenRouterGeneratorBuilder::new()
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    /// Models tried in order: the requested one, then configured fallbacks
    fn model_chain(&self, requested: Option<&str>) -> Vec<String> {
        let mut models = vec![requested.unwrap_or(&self.config.default_model).to_string()];
        for fallback in &self.config.fallback_models {
            if !models.contains(fallback) {
                models.push(fallback.clone());
            }
        }
        models
    }

    async fn complete_with_fallback(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String> {
        let mut last_error = None;

        for model in self.model_chain(params.model.as_deref()) {
            debug!(model = %model, "Attempting policy generation");

            let request = ChatRequest::new(
                &model,
                vec![Message::system(SYSTEM_PROMPT), Message::user(prompt)],
            )
            .with_temperature(params.temperature)
            .with_max_tokens(params.max_tokens);

            match self.execute_request(&request).await {
                Ok(content) => {
                    info!(model = %model, chars = content.len(), "Generation successful");
                    return Ok(content);
                }
                Err(Error::RateLimited(secs)) => {
                    warn!(model = %model, wait_secs = secs, "Rate limited, trying next model");
                    last_error = Some(Error::RateLimited(secs));
                }
                Err(Error::GenerationFailed(msg)) if is_model_error(&msg) => {
                    warn!(model = %model, error = %msg, "Model error, trying next model");
                    last_error = Some(Error::GenerationFailed(msg));
                }
                Err(e) => {
                    error!(model = %model, error = %e, "Non-recoverable generation error");
                    return Err(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::GenerationFailed("All models failed".to_string())))
    }

    /// Execute a chat request with retry logic
    async fn execute_request(&self, request: &ChatRequest) -> Result<String> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.send_request(request).await {
                Ok(content) => return Ok(content),
                Err(Error::RateLimited(wait_secs)) if attempts < MAX_RETRY_ATTEMPTS => {
                    let backoff = calculate_backoff(attempts, wait_secs);
                    warn!(
                        attempt = attempts,
                        wait_ms = backoff,
                        "Rate limited, retrying after backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_request(&self, request: &ChatRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "PromptBandit")
            .json(request)
            .send()
            .await
            .map_err(Error::NetworkError)?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status.as_u16(), &body));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::GenerationFailed(format!("Failed to parse response: {}", e)))?;

        chat_response
            .first_content()
            .map(str::to_string)
            .ok_or_else(|| Error::GenerationFailed("Empty response from API".to_string()))
    }
}

#[async_trait]
impl TextGenerator for OpenRouterGenerator {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        self.complete_with_fallback(prompt, params).await
    }

    fn name(&self) -> &str {
        "openrouter"
    }
}

/// Map a non-success HTTP status to an error
fn error_for_status(status: u16, body: &str) -> Error {
    match status {
        401 => Error::ConfigurationError(
            "Unauthorized: Invalid API key. Set PROMPTBANDIT_API_KEY or OPENROUTER_API_KEY environment variable.".to_string(),
        ),
        429 => Error::RateLimited(extract_retry_after(body).unwrap_or(60)),
        400 => Error::GenerationFailed(format!("Bad request: {}", body)),
        402 => Error::GenerationFailed(
            "Payment required: Insufficient credits on OpenRouter account".to_string(),
        ),
        403 => Error::GenerationFailed(format!("Forbidden: {}", body)),
        404 => Error::GenerationFailed(format!(
            "Model not found or endpoint unavailable: {}",
            body
        )),
        500..=599 => Error::GenerationFailed(format!("Server error ({}): {}", status, body)),
        _ => Error::GenerationFailed(format!("HTTP error {}: {}", status, body)),
    }
}

/// Check if an error message indicates a model-specific error
fn is_model_error(msg: &str) -> bool {
    let model_error_patterns = [
        "model not found",
        "unavailable",
        "not available",
        "no available provider",
        "overloaded",
        "capacity",
        "server error",
    ];

    let msg_lower = msg.to_lowercase();
    model_error_patterns
        .iter()
        .any(|pattern| msg_lower.contains(pattern))
}

/// Calculate backoff delay with jitter
fn calculate_backoff(attempt: u32, suggested_wait: u64) -> u64 {
    let base = BACKOFF_BASE_MS * 2u64.pow(attempt.saturating_sub(1));
    let delay = base.max(suggested_wait * 1000);

    // up to 10% jitter
    let jitter = (delay / 10).max(1);
    delay + rand::thread_rng().gen_range(0..jitter)
}

/// Extract retry-after value from error response
fn extract_retry_after(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    json.get("retry_after")
        .or_else(|| json.get("error").and_then(|e| e.get("retry_after")))
        .and_then(|v| v.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LlmConfig {
        LlmConfig {
            default_model: "test/model".to_string(),
            fallback_models: vec!["fallback/model".to_string(), "test/model".to_string()],
            timeout_secs: 30,
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_generator_builder() {
        let generator = OpenRouterGenerator::builder()
            .config(test_config())
            .api_key("test-key")
            .base_url("https://example.com")
            .timeout_secs(60)
            .build()
            .unwrap();

        assert_eq!(generator.default_model(), "test/model");
        assert_eq!(generator.base_url, "https://example.com");
        assert_eq!(generator.name(), "openrouter");
    }

    #[test]
    fn test_generator_builder_requires_api_key() {
        let result = OpenRouterGenerator::builder().config(test_config()).build();
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }

    #[test]
    fn test_debug_hides_api_key() {
        let generator = OpenRouterGenerator::new(test_config(), "secret-key").unwrap();
        let debug = format!("{:?}", generator);
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("test/model"));
    }

    #[test]
    fn test_generator_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OpenRouterGenerator>();
    }

    #[test]
    fn test_model_chain_dedups() {
        let generator = OpenRouterGenerator::new(test_config(), "k").unwrap();
        assert_eq!(
            generator.model_chain(None),
            vec!["test/model".to_string(), "fallback/model".to_string()]
        );
        assert_eq!(
            generator.model_chain(Some("other/model")),
            vec![
                "other/model".to_string(),
                "fallback/model".to_string(),
                "test/model".to_string()
            ]
        );
    }

    #[test]
    fn test_calculate_backoff() {
        let first = calculate_backoff(1, 0);
        assert!((1000..1100).contains(&first));

        let third = calculate_backoff(3, 0);
        assert!((4000..4400).contains(&third));

        // suggested wait dominates
        let suggested = calculate_backoff(1, 10);
        assert!((10_000..11_000).contains(&suggested));
    }

    #[test]
    fn test_extract_retry_after() {
        assert_eq!(extract_retry_after(r#"{"retry_after": 30}"#), Some(30));
        assert_eq!(extract_retry_after(r#"{"error": {"retry_after": 45}}"#), Some(45));
        assert_eq!(extract_retry_after("not json"), None);
        assert_eq!(extract_retry_after(r#"{"other": 1}"#), None);
    }

    #[test]
    fn test_error_for_status() {
        assert!(matches!(error_for_status(429, "{}"), Error::RateLimited(60)));
        assert!(matches!(error_for_status(401, ""), Error::ConfigurationError(_)));
        match error_for_status(503, "overloaded") {
            Error::GenerationFailed(msg) => assert!(is_model_error(&msg)),
            other => panic!("unexpected error: {other:?}"),
        }
        match error_for_status(400, "bad") {
            Error::GenerationFailed(msg) => assert!(!is_model_error(&msg)),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
