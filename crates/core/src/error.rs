//! Error types for the chronicle core pipeline

use std::path::PathBuf;

use thiserror::Error;

/// Core errors for the snapshot analysis pipeline
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Snapshot discovery error: {0}")]
    Discovery(String),

    #[error("Archive error for {path}: {message}")]
    Archive { path: PathBuf, message: String },

    #[error("Cache file {path} is corrupted: {message}")]
    CorruptCache { path: PathBuf, message: String },

    #[error("LLM API error ({status:?}): {message}")]
    Api {
        status: Option<u16>,
        message: String,
    },

    #[error(
        "Model failed after {attempts} attempt(s) (fallbacks tried: {fallbacks:?}): {reason}"
    )]
    Model {
        reason: String,
        attempts: u32,
        fallbacks: Vec<String>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error represents a transient transport failure worth
    /// retrying (rate limits, connection trouble, server errors, timeouts).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api { status, message } => {
                if matches!(status, Some(429) | Some(500) | Some(502) | Some(503) | Some(504)) {
                    return true;
                }
                let msg = message.to_lowercase();
                msg.contains("rate limit")
                    || msg.contains("rate_limit")
                    || msg.contains("connection")
                    || msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("overloaded")
                    || msg.contains("internal server error")
            }
            _ => false,
        }
    }
}

/// Result type alias for chronicle core
pub type Result<T> = std::result::Result<T, Error>;
