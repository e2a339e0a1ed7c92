//! Error types for relata.

use thiserror::Error;

/// The main error type for descriptor construction and backend execution.
#[derive(Debug, Error)]
pub enum RelataError {
    /// A model, relationship, or backend is configured inconsistently.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A call was made with a malformed shape (empty path, bad spec).
    #[error("Argument error: {0}")]
    Argument(String),

    /// A backend rejected or failed to run a rendered command.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The connection to a storage engine was refused or lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelataError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an argument error.
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument(message.into())
    }

    /// Create an execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }
}

/// Result type alias for relata operations.
pub type RelataResult<T> = Result<T, RelataError>;
