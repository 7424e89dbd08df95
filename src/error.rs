//! Error types for voicedesk

use thiserror::Error;

/// Result type alias for voicedesk operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in voicedesk
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone unavailable or access denied
    #[error("permission error: {0}")]
    Permission(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Capture device runs below the session input rate
    #[error("unsupported sample rate: {0} Hz (minimum {min} Hz)", min = crate::voice::INPUT_SAMPLE_RATE)]
    UnsupportedSampleRate(u32),

    /// Malformed base64 or PCM payload
    #[error("decode error: {0}")]
    Decode(String),

    /// Remote session open/send/receive failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Email or webhook delivery failure
    #[error("notification error: {0}")]
    Notification(String),

    /// Operation not valid in the current connection state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Action status would move backwards or skip a step
    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// Action ID
        id: String,
        /// Current status
        from: crate::actions::ActionStatus,
        /// Requested status
        to: crate::actions::ActionStatus,
    },

    /// Action not present in the log
    #[error("action not found: {0}")]
    ActionNotFound(String),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
