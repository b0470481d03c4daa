//! Error types for Presence Sync

use thiserror::Error;

/// Main error type for Presence Sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// A Replica attempted an operation reserved for the Authority
    #[error("Operation requires authority: {0}")]
    NotAuthority(String),

    /// Navigation target is not in the view allow-list
    #[error("Unknown view: {0}")]
    UnknownView(String),

    /// Required configuration is missing or out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session has not been initialized (or was shut down)
    #[error("Session not initialized")]
    NotInitialized,

    /// Inbound frame could not be interpreted as a sync envelope
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Envelope belongs to a different session
    #[error("Session mismatch: expected {expected}, got {actual}")]
    SessionMismatch {
        /// Our session id
        expected: String,
        /// The session id carried by the envelope
        actual: String,
    },

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The transport refused or failed to send a frame
    #[error("Transport error: {0}")]
    Transport(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
