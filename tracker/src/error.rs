//! Error types for the tracker.
//!
//! Errors only surface while starting or configuring tracking. Once the
//! coordinator is running, failures end in the log and never reach the
//! editing path.

use thiserror::Error;

use crate::config::ConfigError;
use crate::sender::SenderError;

/// Errors that can occur while setting up heartbeat tracking.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The dispatch queue could not be started.
    #[error("dispatch error: {0}")]
    Sender(#[from] SenderError),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrackerError {
    /// Returns `true` when tracking is simply switched off.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Config(ConfigError::Disabled))
    }
}

/// A specialized `Result` type for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
