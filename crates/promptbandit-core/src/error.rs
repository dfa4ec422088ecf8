//! Error types for PromptBandit

use thiserror::Error;

/// Result type alias using PromptBandit's Error
pub type Result<T> = std::result::Result<T, Error>;

/// PromptBandit error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (E100-E199)
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    // Registry errors (E200-E299)
    #[error("No active templates available for category '{0}'. Register or activate a template first.")]
    NoActiveTemplates(String),

    #[error("Template '{0}' not found (unknown id or expired selection token).")]
    TemplateNotFound(String),

    #[error("Template '{0}' is already registered. Template ids are immutable; bump the version instead.")]
    DuplicateTemplate(String),

    #[error("Optimization session '{0}' not found")]
    SessionNotFound(String),

    // Generation errors (E300-E399)
    #[error("Text generation failed: {0}")]
    GenerationFailed(String),

    #[error("Text generation timed out after {0} seconds")]
    GenerationTimeout(u64),

    #[error("Rate limited. Waiting {0} seconds before retry.")]
    RateLimited(u64),

    #[error("Network error: {0}. Check your internet connection.")]
    NetworkError(#[from] reqwest::Error),

    // Storage errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigurationError(_) => "E100",
            Self::NoActiveTemplates(_) => "E200",
            Self::TemplateNotFound(_) => "E201",
            Self::DuplicateTemplate(_) => "E202",
            Self::SessionNotFound(_) => "E203",
            Self::GenerationFailed(_) => "E300",
            Self::GenerationTimeout(_) => "E301",
            Self::RateLimited(_) => "E302",
            Self::NetworkError(_) => "E303",
            Self::DatabaseError(_) => "E400",
            Self::Serialization(_) => "E401",
            Self::InvalidInput(_) => "E800",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::ConfigurationError(_) => Some("promptbandit config list".to_string()),
            Self::NoActiveTemplates(_) => Some("promptbandit templates seed".to_string()),
            Self::TemplateNotFound(_) => Some("promptbandit templates list".to_string()),
            Self::SessionNotFound(_) => Some("promptbandit metrics".to_string()),
            Self::DuplicateTemplate(id) => Some(format!("promptbandit templates list | grep {}", id)),
            Self::NetworkError(_) => Some("Check internet connection".to_string()),
            Self::GenerationFailed(_) => {
                Some("promptbandit config set llm.provider offline".to_string())
            }
            _ => None,
        }
    }

    /// Whether the caller can recover locally (log and skip) without aborting
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TemplateNotFound(_)
                | Self::RateLimited(_)
                | Self::GenerationTimeout(_)
                | Self::GenerationFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::ConfigurationError("x".into()).code(), "E100");
        assert_eq!(Error::NoActiveTemplates("adaptive".into()).code(), "E200");
        assert_eq!(Error::TemplateNotFound("t".into()).code(), "E201");
        assert_eq!(Error::Other("x".into()).code(), "E9999");
    }

    #[test]
    fn test_template_not_found_is_recoverable() {
        assert!(Error::TemplateNotFound("stale".into()).is_recoverable());
        assert!(!Error::ConfigurationError("bad weights".into()).is_recoverable());
    }

    #[test]
    fn test_suggestions() {
        assert_eq!(
            Error::NoActiveTemplates("x".into()).suggestion().as_deref(),
            Some("promptbandit templates seed")
        );
        assert!(Error::InvalidInput("x".into()).suggestion().is_none());
    }

    #[test]
    fn test_error_display_mentions_id() {
        let err = Error::DuplicateTemplate("constitutional_v1_0".into());
        assert!(err.to_string().contains("constitutional_v1_0"));
    }
}
