//! Configuration Error Types
//!
//! Specific, actionable error messages for configuration loading and validation.

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = std::result::Result<T, ConfigurationError>;

/// Configuration-related errors with detailed context
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Configuration directory or base file missing
    #[error("Configuration file not found. Searched paths: {searched_paths:?}")]
    ConfigFileNotFound { searched_paths: Vec<PathBuf> },

    /// Layered sources could not be read or merged
    #[error("Failed to load configuration for '{environment}': {error}")]
    LoadError { environment: String, error: String },

    /// Merged sources did not match the configuration schema
    #[error("Failed to deserialize configuration: {error}")]
    DeserializeError { error: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// Cross-field validation errors
    #[error("Configuration validation failed: {error}")]
    ValidationError { error: String },
}

impl ConfigurationError {
    pub fn config_file_not_found(searched_paths: Vec<PathBuf>) -> Self {
        Self::ConfigFileNotFound { searched_paths }
    }

    pub fn invalid_value<F: Into<String>, V: ToString, C: Into<String>>(
        field: F,
        value: V,
        context: C,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            context: context.into(),
        }
    }

    pub fn validation_error<E: Into<String>>(error: E) -> Self {
        Self::ValidationError {
            error: error.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(error: config::ConfigError) -> Self {
        Self::DeserializeError {
            error: error.to_string(),
        }
    }
}
