//! Error types for ClawMate
//!
//! Every layer reports failures through this one enum so the transport layer
//! can map them onto a stable error kind.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Stable, serializable classification of an [`Error`].
///
/// This is what user-visible failures carry next to the request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvalidRequest,
    ApprovalDenied,
    ExecutionTimeout,
    SandboxUnavailable,
    StreamDisconnected,
    ResourceExhausted,
    Cancelled,
    Config,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid-request",
            Self::ApprovalDenied => "approval-denied",
            Self::ExecutionTimeout => "execution-timeout",
            Self::SandboxUnavailable => "sandbox-unavailable",
            Self::StreamDisconnected => "stream-disconnected",
            Self::ResourceExhausted => "resource-exhausted",
            Self::Cancelled => "cancelled",
            Self::Config => "config",
            Self::Io => "io",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ClawMate error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Request / approval
    // ========================================================================
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Approval denied: {0}")]
    ApprovalDenied(String),

    // ========================================================================
    // Execution
    // ========================================================================
    #[error("Execution timed out: {0}")]
    ExecutionTimeout(String),

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("Stream disconnected: {0}")]
    StreamDisconnected(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // External error conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The stable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::ApprovalDenied(_) => ErrorKind::ApprovalDenied,
            Error::ExecutionTimeout(_) => ErrorKind::ExecutionTimeout,
            Error::SandboxUnavailable(_) => ErrorKind::SandboxUnavailable,
            Error::StreamDisconnected(_) => ErrorKind::StreamDisconnected,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Config(_) | Error::Json(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same request might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ExecutionTimeout(_) | Error::SandboxUnavailable(_) | Error::ResourceExhausted(_)
        )
    }

    /// Whether the error is an outcome the user caused or chose, rather than a fault
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_) | Error::ApprovalDenied(_) | Error::Cancelled
        )
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidRequest(message.into())
    }

    pub fn sandbox_unavailable(message: impl Into<String>) -> Self {
        Error::SandboxUnavailable(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
