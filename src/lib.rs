//! Warden: keeper of the Claude runtime binary
//!
//! Discovers, downloads, verifies and switches versions of the externally
//! distributed runtime, and keeps one resumable background session alive for
//! short utility requests like title generation.

pub mod cli;
pub mod config;
pub mod credentials;
pub mod platform;
pub mod runtime;
pub mod session;
pub mod state;
pub mod utility;
pub mod versions;

#[cfg(test)]
pub(crate) mod test_support;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Binary missing on disk: {0}")]
    MissingBinary(String),

    #[error("Session not ready (status: {0})")]
    NotReady(String),

    #[error("Session init failed: {0}")]
    InitFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Refusing to modify version {0}: it is active or bundled")]
    Guarded(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for WardenError {
    fn from(err: reqwest::Error) -> Self {
        WardenError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
