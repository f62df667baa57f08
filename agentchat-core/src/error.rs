//! Error types for agentchat-core

use thiserror::Error;

/// Main error type for the agentchat-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No registered adapter handles the provider code
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Provider requires an API key and none was resolved
    #[error("missing credential for provider: {0}")]
    MissingCredential(String),

    /// Agent, model, provider or prompt reference could not be resolved
    #[error("{kind} not found: {id}")]
    ReferenceNotFound { kind: &'static str, id: i64 },

    /// Session does not exist, was deleted, or belongs to another user
    #[error("session not found: {0}")]
    SessionNotFound(i64),

    /// Backend call failed (sync or streaming)
    #[error("model invocation failed ({provider}): {message}")]
    ModelInvocation { provider: String, message: String },
}

impl Error {
    /// Shorthand for a failed backend call
    pub fn invocation(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ModelInvocation {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for agentchat-core
pub type Result<T> = std::result::Result<T, Error>;
