//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::optimizer::{Algorithm, MabConfig};

/// Environment variable that relocates the config directory
pub const CONFIG_DIR_ENV: &str = "PROMPTBANDIT_CONFIG_DIR";

/// PromptBandit configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mab: MabConfig,
    pub llm: LlmConfig,
    pub storage: StorageConfig,
}

/// Which text generator backs synthesis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Deterministic local synthesiser, no network
    #[default]
    Offline,
    /// OpenRouter chat completions
    OpenRouter,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::OpenRouter => write!(f, "openrouter"),
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "offline" | "local" => Ok(Self::Offline),
            "openrouter" => Ok(Self::OpenRouter),
            _ => Err(anyhow!(
                "Invalid llm provider: {}. Valid options: offline, openrouter",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    #[serde(skip)]
    pub api_key: Option<String>,
    pub default_model: String,
    pub fallback_models: Vec<String>,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Offline,
            api_key: None,
            default_model: "anthropic/claude-sonnet-4-20250514".to_string(),
            fallback_models: vec!["openai/gpt-4o".to_string()],
            temperature: 0.2,
            max_tokens: 2048,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file; defaults to `promptbandit.db` in the config directory
    pub database_path: Option<PathBuf>,
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;

        Ok(env::var("PROMPTBANDIT_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .ok())
    }

    pub fn redacted_api_key(&self) -> anyhow::Result<Option<String>> {
        self.resolved_api_key().map(|opt| {
            opt.map(|key| {
                if key.len() <= 4 {
                    "***".to_string()
                } else {
                    let suffix = &key[key.len() - 4..];
                    format!("***{}", suffix)
                }
            })
        })
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "LLM API keys must be provided via environment variables, not stored in configuration"
            ));
        }
        Ok(())
    }
}

const KEYS: &[&str] = &[
    "mab.algorithm",
    "mab.exploration_rate",
    "mab.confidence_level",
    "mab.alpha_prior",
    "mab.beta_prior",
    "mab.weights.similarity",
    "mab.weights.quality",
    "mab.weights.compliance",
    "mab.weights.bias",
    "mab.min_uses_for_confidence",
    "mab.reward_threshold",
    "mab.update_frequency",
    "mab.convergence_window",
    "mab.token_ttl_secs",
    "llm.provider",
    "llm.default_model",
    "llm.fallback_models",
    "llm.temperature",
    "llm.max_tokens",
    "llm.timeout_secs",
    "llm.api_key",
    "storage.database_path",
];

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("Invalid {} value: {}", key, value))
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("promptbandit")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Database file, explicit or next to the config file
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("promptbandit.db")),
        }
    }

    /// Load configuration from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.llm.enforce_env_only()?;
        self.mab
            .validate()
            .map_err(|e| anyhow!("Invalid optimizer configuration: {}", e))
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let mab = &self.mab;
        let weights = &mab.reward_weights;
        match key {
            "mab.algorithm" => Ok(mab.algorithm.to_string()),
            "mab.exploration_rate" => Ok(mab.exploration_rate.to_string()),
            "mab.confidence_level" => Ok(mab.confidence_level.to_string()),
            "mab.alpha_prior" => Ok(mab.alpha_prior.to_string()),
            "mab.beta_prior" => Ok(mab.beta_prior.to_string()),
            "mab.weights.similarity" => Ok(weights.semantic_similarity.to_string()),
            "mab.weights.quality" => Ok(weights.policy_quality.to_string()),
            "mab.weights.compliance" => Ok(weights.constitutional_compliance.to_string()),
            "mab.weights.bias" => Ok(weights.bias_mitigation.to_string()),
            "mab.min_uses_for_confidence" => Ok(mab.min_uses_for_confidence.to_string()),
            "mab.reward_threshold" => Ok(mab.reward_threshold.to_string()),
            "mab.update_frequency" => Ok(mab.update_frequency.to_string()),
            "mab.convergence_window" => Ok(mab.convergence_window.to_string()),
            "mab.token_ttl_secs" => Ok(mab.token_ttl_secs.to_string()),

            "llm.provider" => Ok(self.llm.provider.to_string()),
            "llm.default_model" => Ok(self.llm.default_model.clone()),
            "llm.fallback_models" => Ok(self.llm.fallback_models.join(", ")),
            "llm.temperature" => Ok(self.llm.temperature.to_string()),
            "llm.max_tokens" => Ok(self.llm.max_tokens.to_string()),
            "llm.timeout_secs" => Ok(self.llm.timeout_secs.to_string()),

            "storage.database_path" => Ok(self.database_path()?.display().to_string()),

            "llm.api_key" | "api_key" => match self.llm.redacted_api_key()? {
                Some(redacted) => Ok(redacted),
                None => Ok(
                    "(not set - use PROMPTBANDIT_API_KEY or OPENROUTER_API_KEY env var)"
                        .to_string(),
                ),
            },

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `promptbandit config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    ///
    /// The change is rejected, leaving the config untouched, if the result
    /// would not validate.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut next = self.clone();
        let mab = &mut next.mab;

        match key {
            "mab.algorithm" => {
                mab.algorithm = value
                    .parse::<Algorithm>()
                    .map_err(|e| anyhow!("{}", e))?;
            }
            "mab.exploration_rate" => mab.exploration_rate = parse(key, value)?,
            "mab.confidence_level" => mab.confidence_level = parse(key, value)?,
            "mab.alpha_prior" => mab.alpha_prior = parse(key, value)?,
            "mab.beta_prior" => mab.beta_prior = parse(key, value)?,
            "mab.weights.similarity" => mab.reward_weights.semantic_similarity = parse(key, value)?,
            "mab.weights.quality" => mab.reward_weights.policy_quality = parse(key, value)?,
            "mab.weights.compliance" => {
                mab.reward_weights.constitutional_compliance = parse(key, value)?
            }
            "mab.weights.bias" => mab.reward_weights.bias_mitigation = parse(key, value)?,
            "mab.min_uses_for_confidence" => mab.min_uses_for_confidence = parse(key, value)?,
            "mab.reward_threshold" => mab.reward_threshold = parse(key, value)?,
            "mab.update_frequency" => mab.update_frequency = parse(key, value)?,
            "mab.convergence_window" => mab.convergence_window = parse(key, value)?,
            "mab.token_ttl_secs" => mab.token_ttl_secs = parse(key, value)?,

            "llm.provider" => next.llm.provider = value.parse()?,
            "llm.default_model" => {
                next.llm.default_model = value.to_string();
            }
            "llm.fallback_models" => {
                next.llm.fallback_models = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "llm.temperature" => {
                let temp: f32 = parse(key, value)?;
                if !(0.0..=2.0).contains(&temp) {
                    return Err(anyhow!("Temperature must be between 0.0 and 2.0"));
                }
                next.llm.temperature = temp;
            }
            "llm.max_tokens" => next.llm.max_tokens = parse(key, value)?,
            "llm.timeout_secs" => next.llm.timeout_secs = parse(key, value)?,

            "storage.database_path" => {
                next.storage.database_path = if value.trim().is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value.trim()))
                };
            }

            "llm.api_key" | "api_key" => {
                return Err(anyhow!(
                    "API keys cannot be stored in configuration for security. \
                     Set the PROMPTBANDIT_API_KEY or OPENROUTER_API_KEY environment variable instead."
                ));
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `promptbandit config list` to see available keys.",
                    key
                ));
            }
        }

        next.validate()?;
        *self = next;
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect::<anyhow::Result<Vec<_>>>()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}
