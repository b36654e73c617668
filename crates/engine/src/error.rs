//! Error taxonomy for the segment production engine.
//!
//! Variants map one-to-one onto the error kinds in the engine's design
//! document; the HTTP boundary (in the `server` crate) maps each to a status
//! code.

use std::io;

/// Errors the engine surfaces to its caller (the `server` crate's HTTP layer).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The encoder exited non-zero, or its stdout closed before reaching the
    /// requested id. Pending waiters wake with this; the next request
    /// triggers a fresh restart.
    #[error("encoder failed before producing chunk {id}")]
    TransientProducerFailure { id: u64 },

    /// A waiter exceeded its deadline. The encoder is left running.
    #[error("timed out waiting for chunk {id}")]
    WaitTimeout { id: u64 },

    /// The requested quality label has no corresponding Stream.
    #[error("unknown quality '{0}'")]
    NotFound(String),

    /// A segment filename (or quality label) did not match the expected
    /// pattern.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Opening or reading a segment file that is supposed to be ready
    /// failed.
    #[error("segment store I/O error: {0}")]
    StoreIoError(#[source] io::Error),

    /// The encoder binary could not be launched at all.
    #[error("failed to launch encoder: {0}")]
    FatalConfig(String),
}

impl EngineError {
    pub fn store_io(err: io::Error) -> Self {
        Self::StoreIoError(err)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
