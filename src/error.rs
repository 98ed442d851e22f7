//! Error types for Chatflow
//!
//! This module defines all error types used throughout the application,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for Chatflow operations
///
/// This enum encompasses all possible errors that can occur during
/// configuration loading, provider interactions, persistence, quota
/// gating and the streaming message pipeline.
#[derive(Error, Debug)]
pub enum ChatflowError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider-related errors (API calls, authentication, etc.)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Input rejected before any state mutation (empty text, malformed request)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller could not be identified by the identity collaborator
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No session exists with the given identifier
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// No message exists with the given identifier
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// The quota backing store could not be consulted; the gate fails closed
    #[error("Quota check unavailable: {0}")]
    QuotaUnavailable(String),

    /// Daily or monthly usage limit reached
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Transport-level failure while streaming a response
    #[error("Transport error: {0}")]
    Transport(String),

    /// No chunk arrived within the configured idle window
    #[error("Stream timed out after {seconds}s of inactivity")]
    StreamTimeout {
        /// Idle window that elapsed
        seconds: u64,
    },

    /// Title summarization failed
    #[error("Title generation error: {0}")]
    TitleGeneration(String),

    /// A turn is already in flight for this pipeline
    #[error("Pipeline busy: {0}")]
    PipelineBusy(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Session/message/quota storage errors (database operations)
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type alias for Chatflow operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
