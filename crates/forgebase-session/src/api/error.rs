use thiserror::Error;
use tracing::debug;

use super::envelope::error_message;

#[derive(Error, Debug)]
pub enum ApiError {
    /// 401, with the backend's message when it sent one
    #[error("Unauthorized{}", detail_suffix(.0))]
    Unauthorized(Option<String>),

    #[error("Access denied{}", detail_suffix(.0))]
    AccessDenied(Option<String>),

    #[error("Resource not found{}", detail_suffix(.0))]
    NotFound(Option<String>),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    /// Validation or business error reported by the backend (4xx)
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("Server error{}", detail_suffix(.0))]
    ServerError(Option<String>),

    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Input rejected locally before any request was sent
    #[error("{0}")]
    Validation(String),
}

fn detail_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {}", m))
        .unwrap_or_default()
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Map a non-success status and its body to an error.
    ///
    /// The backend's `error.message` is used verbatim when present. Bodies
    /// without one (proxy error pages, plain text) are only logged.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = error_message(body);
        if message.is_none() && !body.is_empty() {
            debug!(status, body = %Self::truncate_body(body), "Error response without a message");
        }
        match status {
            401 => ApiError::Unauthorized(message),
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(message),
            _ => ApiError::Rejected {
                status,
                message: message
                    .unwrap_or_else(|| format!("Request failed with status {}", status)),
            },
        }
    }

    /// Map a transport failure from reqwest
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_connect() {
            ApiError::Connection(err.to_string())
        } else {
            ApiError::NetworkError(err)
        }
    }

    /// Whether the failure happened before the backend produced a response
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ApiError::Timeout | ApiError::Connection(_) | ApiError::NetworkError(_)
        )
    }

    /// Message suitable for showing to the user.
    ///
    /// Backend-provided messages pass through unchanged; `fallback` is used
    /// for failures that carry nothing readable.
    pub fn user_message(&self, fallback: &str) -> String {
        match self {
            ApiError::Rejected { message, .. } | ApiError::Validation(message) => message.clone(),
            ApiError::Unauthorized(Some(message))
            | ApiError::AccessDenied(Some(message))
            | ApiError::NotFound(Some(message))
            | ApiError::ServerError(Some(message)) => message.clone(),
            ApiError::Unauthorized(None) => "Invalid credentials or session expired".to_string(),
            ApiError::RateLimited => "Too many requests. Please wait and try again.".to_string(),
            ApiError::Timeout => "Connection timed out. Please try again.".to_string(),
            ApiError::Connection(_) | ApiError::NetworkError(_) => {
                "Unable to connect to server. Check your network connection.".to_string()
            }
            _ => fallback.to_string(),
        }
    }
}
