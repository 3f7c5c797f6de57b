//! Error types for shellcage.

use std::path::PathBuf;

use crate::sandbox::SandboxError;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Safety error: {0}")]
    Safety(#[from] SafetyError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised while loading the security pattern lists.
#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    #[error("Failed to read pattern file {path}: {source}")]
    PatternFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse pattern file {path}: {source}")]
    PatternFileParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No pattern file configured; nothing to rescan")]
    NoPatternFile,
}

/// HTTP surface errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
