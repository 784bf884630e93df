// src/error.rs - Crate-wide error type

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file could not be read, parsed or validated.
    /// Fatal at startup only.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The configured encoder executable does not exist or cannot run.
    #[error("encoder executable not found: {0}")]
    EncoderNotFound(String),

    /// Spawning the encoder process failed. Counts as a crash towards the
    /// restart breaker.
    #[error("failed to start encoder: {0}")]
    EncoderStartFailed(String),

    /// Capture source enumeration or resolution failed.
    #[error("capture source error: {0}")]
    Source(String),

    /// Listener setup or other server-level failure.
    #[error("server error: {0}")]
    Server(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
