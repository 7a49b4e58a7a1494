//! Error types shared by the workspace.

use thiserror::Error;

/// Main error type for configuration and process-level failures.
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Config error: {0}")]
    Config(String),

    /// A configuration value is out of its valid range
    #[error("Invalid config value for `{key}`: {message}")]
    InvalidValue {
        /// Dotted key of the offending value.
        key: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;
