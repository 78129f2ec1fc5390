//! Error types for the uploader module

use easypan_api::ApiError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Upload error types
#[derive(Debug, Error)]
pub enum UploadError {
    /// Upload was cancelled
    #[error("Upload cancelled")]
    Cancelled,

    /// Content digest could not be computed
    #[error("Failed to compute file digest: {0}")]
    Digest(String),

    /// Failed to read local file
    #[error("Failed to read local file: {0}")]
    FileRead(String),

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Request exceeded its timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Credentials missing or expired
    #[error("Authentication required: {0}")]
    Unauthorized(String),

    /// Server rejected the request
    #[error("Server error ({code}): {message}")]
    Server { code: i32, message: String },

    /// Server answered with something this client cannot interpret
    #[error("Invalid server response: {0}")]
    InvalidResponse(String),

    /// Server-side post-processing failed
    #[error("Transcode failed: {0}")]
    Transcode(String),

    /// No task with the given id
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Operation not allowed in the task's current state
    #[error("Cannot {action} task in state {status}")]
    InvalidState { action: &'static str, status: String },

    /// Status change outside the task lifecycle
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Failure category shown to the user and used for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Digest,
    Network,
    Timeout,
    Auth,
    Server,
    Transcode,
    Io,
    Cancelled,
}

impl ErrorKind {
    /// Short status tag for a task that failed with this kind
    pub fn failure_label(&self) -> &'static str {
        match self {
            ErrorKind::Digest => "digest failed",
            ErrorKind::Network => "network error",
            ErrorKind::Timeout => "request timed out",
            ErrorKind::Auth => "login required",
            ErrorKind::Server => "server error",
            ErrorKind::Transcode => "transcode failed",
            ErrorKind::Io => "read failed",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl UploadError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Network(_) | UploadError::Timeout(_) => true,
            UploadError::Server { code, .. } => {
                !(400..500).contains(code) || *code == 408 || *code == 429
            }
            _ => false,
        }
    }

    /// Check if this error is due to cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Cancelled => ErrorKind::Cancelled,
            UploadError::Digest(_) => ErrorKind::Digest,
            UploadError::FileRead(_) => ErrorKind::Io,
            UploadError::Network(_) => ErrorKind::Network,
            UploadError::Timeout(_) => ErrorKind::Timeout,
            UploadError::Unauthorized(_) => ErrorKind::Auth,
            UploadError::Transcode(_) => ErrorKind::Transcode,
            UploadError::Server { .. }
            | UploadError::InvalidResponse(_)
            | UploadError::TaskNotFound(_)
            | UploadError::InvalidState { .. }
            | UploadError::InvalidTransition { .. }
            | UploadError::Other(_) => ErrorKind::Server,
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(action: &'static str, status: impl ToString) -> Self {
        UploadError::InvalidState {
            action,
            status: status.to_string(),
        }
    }
}

/// Last error recorded on a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&UploadError> for TaskError {
    fn from(err: &UploadError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::FileRead(err.to_string())
    }
}

impl From<ApiError> for UploadError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Http(message) => UploadError::Network(message),
            ApiError::Timeout(message) => UploadError::Timeout(message),
            ApiError::Unauthorized(message) => UploadError::Unauthorized(message),
            ApiError::Server { code, message } => UploadError::Server { code, message },
            ApiError::Decode(message) => UploadError::InvalidResponse(message),
            ApiError::Other(message) => UploadError::Other(message),
        }
    }
}
