use serde::Deserialize;
use thiserror::Error;

/// Result type for API calls
pub type ApiResult<T> = Result<T, ApiError>;

/// Application code for a successful call
pub const CODE_SUCCESS: i32 = 200;

/// Application code returned when the login session has timed out
pub const CODE_LOGIN_TIMEOUT: i32 = 901;

/// Application code returned when the caller must log in first
pub const CODE_LOGIN_REQUIRED: i32 = 632;

/// Envelope wrapping every JSON response from the server
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub status: Option<String>,
    pub code: i32,
    pub info: Option<String>,
    pub data: Option<T>,
}

/// API error types
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure (connection refused, reset, DNS, ...)
    #[error("Network error: {0}")]
    Http(String),

    /// Request exceeded the configured timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Credentials missing, expired or rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Server answered with a non-success code
    #[error("Server error ({code}): {message}")]
    Server { code: i32, message: String },

    /// Response body could not be decoded
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Build an error from a non-success envelope
    pub fn from_response<T>(response: ApiResponse<T>) -> Self {
        let message = response
            .info
            .filter(|info| !info.is_empty())
            .unwrap_or_else(|| "Request failed".to_string());

        match response.code {
            CODE_LOGIN_TIMEOUT | CODE_LOGIN_REQUIRED => ApiError::Unauthorized(message),
            code => ApiError::Server { code, message },
        }
    }

    /// Build an error from an HTTP status that is not 2xx
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = if body.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        } else {
            body.to_string()
        };

        match status.as_u16() {
            401 | 403 => ApiError::Unauthorized(message),
            code => ApiError::Server {
                code: code as i32,
                message,
            },
        }
    }

    /// Whether the call may succeed if repeated unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http(_) | ApiError::Timeout(_) => true,
            // 4xx other than timeouts and throttling are the caller's fault
            ApiError::Server { code, .. } => !(400..500).contains(code) || *code == 408 || *code == 429,
            ApiError::Unauthorized(_) | ApiError::Decode(_) | ApiError::Other(_) => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::from_status(status, "")
        } else {
            ApiError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}
