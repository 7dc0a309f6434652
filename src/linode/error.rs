//! Linode API error type and its classification

use serde::Deserialize;
use thiserror::Error;

/// Canonical classification of a cloud API failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    RateLimited,
    ServerError,
    AuthFailed,
    Other,
}

impl ErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::AuthFailed,
            404 => ErrorKind::NotFound,
            429 => ErrorKind::RateLimited,
            s if s >= 500 => ErrorKind::ServerError,
            _ => ErrorKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::Other => "other",
        }
    }
}

#[derive(Error, Debug)]
pub enum LinodeError {
    /// The API answered with a non-success status
    #[error("[{status}] {message}")]
    Api { status: u16, message: String },

    /// The request never produced a response
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body did not match the expected schema
    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl LinodeError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        LinodeError::Api {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        LinodeError::api(404, format!("{what} not found"))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            LinodeError::Api { status, .. } => Some(*status),
            LinodeError::Http(e) => e.status().map(|s| s.as_u16()),
            LinodeError::Decode(_) => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LinodeError::Http(e) if e.is_timeout() || e.is_connect() => ErrorKind::ServerError,
            _ => self
                .status()
                .map(ErrorKind::from_status)
                .unwrap_or(ErrorKind::Other),
        }
    }
}

/// Error body returned by the API: `{"errors": [{"reason": "...", "field": "..."}]}`
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub errors: Vec<ErrorReason>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorReason {
    pub reason: String,
    #[serde(default)]
    pub field: Option<String>,
}

impl ErrorBody {
    pub fn message(&self) -> String {
        self.errors
            .iter()
            .map(|e| match &e.field {
                Some(field) => format!("{field}: {}", e.reason),
                None => e.reason.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}
