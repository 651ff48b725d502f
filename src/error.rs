//! Error types for Agentry

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Agentry's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Agentry
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport could not be established or was lost at launch
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Malformed wire frame
    #[error("Protocol framing error: {0}")]
    Framing(String),

    /// Deadline elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection is degraded or closed
    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    /// Server-reported JSON-RPC error
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Tool name resolves to nothing
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Arguments rejected by the declared input schema
    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    /// Invocation or task was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Model provider failure
    #[error("Model call failed: {0}")]
    ModelCall(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Unauthorized access
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable classification carried in invocation results and status exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    TransportUnavailable,
    Framing,
    Timeout,
    ServerUnavailable,
    Rpc,
    UnknownTool,
    SchemaValidation,
    Cancelled,
    ModelCall,
    Internal,
}

impl Error {
    /// Classify into the stable kind used by exports
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            Error::Framing(_) | Error::Json(_) => ErrorKind::Framing,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ServerUnavailable(_) => ErrorKind::ServerUnavailable,
            Error::Rpc { .. } => ErrorKind::Rpc,
            Error::UnknownTool(_) => ErrorKind::UnknownTool,
            Error::SchemaValidation(_) => ErrorKind::SchemaValidation,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::ModelCall(_) | Error::RateLimit(_) | Error::Unauthorized(_) | Error::Http(_) => {
                ErrorKind::ModelCall
            }
            Error::Io(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::RateLimit(_) | Error::Timeout(_) | Error::ServerUnavailable(_)
        )
    }

    /// Check if the failure is scoped to a single invocation rather than
    /// the connection or the task
    pub fn is_invocation_scoped(&self) -> bool {
        matches!(
            self,
            Error::UnknownTool(_)
                | Error::SchemaValidation(_)
                | Error::Timeout(_)
                | Error::Rpc { .. }
                | Error::Cancelled(_)
        )
    }
}
