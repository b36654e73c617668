//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type. Wraps `engine::EngineError` plus the errors
/// that can only happen at the HTTP/config boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] engine::EngineError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
