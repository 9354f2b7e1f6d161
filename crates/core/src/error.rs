//! Error types shared by the frameflight crates.

use thiserror::Error;

/// Main error type for configuration and process-level failures.
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration is well-formed but unusable
    #[error("Config error: {0}")]
    Config(String),

    /// A configuration value could not be parsed
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Configuration key (environment variable name)
        key: String,
        /// Raw value that failed to parse
        value: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the shared Error type.
pub type Result<T> = std::result::Result<T, Error>;
