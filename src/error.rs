//! Error types for Turnstile.
//!
//! Only loading paths (settings, rule files, statistics ranges) produce
//! errors. The admission path resolves every problem into a result value.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Statistics range could not be parsed
    #[error("Invalid statistics range: {0}")]
    InvalidRange(String),

    /// Layered settings could not be built
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Rule file parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON encode/decode errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
