//! Error types for prewarm.

use thiserror::Error;

/// Main error type for prewarm.
#[derive(Error, Debug)]
pub enum PrewarmError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed after {got} of {expected} bytes")]
    ShortRead { expected: usize, got: usize },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Slot handoff failed: {0}")]
    Handoff(String),

    #[error("Failed to spawn {what}: {message}")]
    Spawn { what: &'static str, message: String },

    #[error("{0}")]
    Worker(String),

    #[error("No pool is registered ({0} is not set). Start one with 'prewarm serve'.")]
    NoServer(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),
}

impl PrewarmError {
    pub(crate) fn spawn(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Spawn {
            what,
            message: err.to_string(),
        }
    }
}

/// Result type alias for prewarm operations.
pub type Result<T> = std::result::Result<T, PrewarmError>;
