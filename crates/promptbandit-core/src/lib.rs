//! PromptBandit Core Library
//!
//! Online optimization of prompt templates for constitutional policy
//! synthesis:
//! - Bandit selection over a registry of prompt templates
//! - Reward scoring of generated Rego policies
//! - Sessions, convergence detection and metrics
//! - Storage (SQLite + JSONL export)
//! - LLM integration (OpenRouter API, offline synthesiser)

pub mod config;
pub mod error;
pub mod llm;
pub mod optimizer;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::llm::{GenerationParams, TextGenerator};
    pub use crate::optimizer::{
        Algorithm, MabConfig, PromptOptimizer, PromptTemplate, RewardComponents, SelectionToken,
        SynthesisContext,
    };
}
