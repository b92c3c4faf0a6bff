//! Core error types

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),

    /// JSON configuration could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// TOML configuration could not be parsed
    #[cfg(feature = "toml")]
    #[error("Failed to parse configuration: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A field failed validation; the message names the field
    #[error("{0}")]
    Validation(String),
}

impl ConfigError {
    /// Shorthand for a validation failure.
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Validation(message.into())
    }
}
