//! Error types and HTTP response conversion.
//!
//! This module defines the application's error hierarchy and implements conversion
//! to HTTP responses with appropriate status codes and JSON payloads.
//!
//! # Error Hierarchy
//!
//! The main [`Error`] enum covers every error kind the dispatch pipeline can raise,
//! from authentication failures through upstream relay failures.
//!
//! # HTTP Response Conversion
//!
//! All errors implement [`IntoResponse`] for automatic conversion to HTTP responses
//! with a JSON body of the shape:
//!
//! ```json
//! {
//!   "error": "Invalid API key",
//!   "message": "Invalid API key",
//!   "correlationId": "b3f1..."
//! }
//! ```
//!
//! # Usage in Handlers
//!
//! Handlers return `Result<T, Error>` and errors convert automatically to the
//! appropriate HTTP response:
//!
//! ```ignore
//! use relaygate::errors::Error;
//!
//! async fn handler() -> Result<String, Error> {
//!     Err(Error::InvalidModel {
//!         expected: "claude-3".to_string(),
//!         got: "gpt-4".to_string(),
//!     })
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error as ThisError;
use uuid::Uuid;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Authorization header missing or not a Bearer token
    #[error("Missing or invalid Authorization header")]
    MissingAuth,

    /// Token does not resolve to a KeyRecord in the store
    #[error("Invalid API key")]
    InvalidApiKey,

    /// KeyRecord.expiry is in the past
    #[error("API key has expired")]
    KeyExpired,

    /// usage_today.count >= daily_limit
    #[error("Daily limit reached")]
    DailyLimitReached { current_usage: u64, daily_limit: u64 },

    /// Request body's `model` field doesn't match settings.model_display
    #[error("Invalid model: expected {expected}, got {got}")]
    InvalidModel { expected: String, got: String },

    /// Waterfall exhausted: no default configured and no backup has capacity
    #[error("No upstream source available")]
    NoSourceAvailable,

    /// Upstream responded with a non-2xx status
    #[error("Upstream API error ({status})")]
    UpstreamStatus { status: StatusCode, details: String },

    /// Upstream didn't respond within the request deadline
    #[error("Request timeout")]
    UpstreamTimeout,

    /// Network error, malformed response, or other relay-layer failure
    #[error("Upstream request failed: {0}")]
    UpstreamFailure(String),

    /// Store operation failed on a path where failure must surface to the caller
    #[error("Store error: {0}")]
    Store(String),

    /// Method other than POST hit a dispatch route
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// Catch-all for unexpected internal failures
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MissingAuth => StatusCode::UNAUTHORIZED,
            Error::InvalidApiKey => StatusCode::UNAUTHORIZED,
            Error::KeyExpired => StatusCode::FORBIDDEN,
            Error::DailyLimitReached { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::InvalidModel { .. } => StatusCode::BAD_REQUEST,
            Error::NoSourceAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::UpstreamStatus { status, .. } => *status,
            Error::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::UpstreamFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The `"error"` discriminant in the JSON body: the literal kind strings required by §6,
    /// not snake_case slugs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MissingAuth => "Missing or invalid Authorization header",
            Error::InvalidApiKey => "Invalid API key",
            Error::KeyExpired => "API key has expired",
            Error::DailyLimitReached { .. } => "Daily limit reached",
            Error::InvalidModel { .. } => "Invalid model",
            Error::NoSourceAvailable => "Service Unavailable",
            Error::UpstreamStatus { .. } => "Upstream API error",
            Error::UpstreamTimeout => "Request timeout",
            Error::UpstreamFailure(_) => "Internal server error",
            Error::Store(_) => "Internal server error",
            Error::MethodNotAllowed => "Method not allowed",
            Error::Internal(_) => "Internal server error",
        }
    }

    /// The additional `type` field §6 requires alongside `"Invalid model"`; `None` for every
    /// other kind.
    pub fn error_type(&self) -> Option<&'static str> {
        match self {
            Error::InvalidModel { .. } => Some("invalid_request_error"),
            _ => None,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details.
    pub fn user_message(&self) -> String {
        match self {
            Error::Internal(_) | Error::Store(_) | Error::UpstreamFailure(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(rename = "correlationId")]
    correlation_id: Uuid,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    error_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    daily_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// Wraps an [`Error`] with the correlation ID it should be reported under.
///
/// The bare `Error` doesn't carry a correlation ID (it's generated by the Entry Handler
/// before any fallible step runs), so handlers convert to this at the response boundary.
pub struct ErrorResponse {
    pub error: Error,
    pub correlation_id: Uuid,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let Self { error, correlation_id } = self;

        match &error {
            Error::Store(_) | Error::UpstreamFailure(_) | Error::Internal(_) => {
                tracing::error!(%correlation_id, "{:#}", error);
            }
            Error::UpstreamStatus { status, .. } => {
                tracing::warn!(%correlation_id, %status, "upstream returned non-2xx");
            }
            Error::UpstreamTimeout | Error::NoSourceAvailable => {
                tracing::warn!(%correlation_id, "{}", error);
            }
            Error::MissingAuth | Error::InvalidApiKey | Error::KeyExpired => {
                tracing::info!(%correlation_id, "auth rejected: {}", error);
            }
            Error::DailyLimitReached { .. } | Error::InvalidModel { .. } | Error::MethodNotAllowed => {
                tracing::debug!(%correlation_id, "client error: {}", error);
            }
        }

        let status = error.status_code();
        let (current_usage, daily_limit) = match &error {
            Error::DailyLimitReached { current_usage, daily_limit } => (Some(*current_usage), Some(*daily_limit)),
            _ => (None, None),
        };
        let details = match &error {
            Error::UpstreamStatus { details, .. } => Some(details.clone()),
            _ => None,
        };

        let body = ErrorBody {
            error: error.kind(),
            message: error.user_message(),
            correlation_id,
            error_type: error.error_type(),
            current_usage,
            daily_limit,
            details,
        };

        (status, axum::response::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_emits_the_literal_strings_the_external_contract_requires() {
        assert_eq!(Error::MissingAuth.kind(), "Missing or invalid Authorization header");
        assert_eq!(Error::InvalidApiKey.kind(), "Invalid API key");
        assert_eq!(Error::KeyExpired.kind(), "API key has expired");
        assert_eq!(Error::DailyLimitReached { current_usage: 1, daily_limit: 1 }.kind(), "Daily limit reached");
        assert_eq!(Error::InvalidModel { expected: "a".to_string(), got: "b".to_string() }.kind(), "Invalid model");
        assert_eq!(Error::NoSourceAvailable.kind(), "Service Unavailable");
        assert_eq!(Error::UpstreamTimeout.kind(), "Request timeout");
        assert_eq!(Error::Internal("boom".to_string()).kind(), "Internal server error");
    }

    #[test]
    fn only_invalid_model_carries_the_invalid_request_error_type() {
        assert_eq!(
            Error::InvalidModel { expected: "a".to_string(), got: "b".to_string() }.error_type(),
            Some("invalid_request_error")
        );
        assert_eq!(Error::InvalidApiKey.error_type(), None);
        assert_eq!(Error::NoSourceAvailable.error_type(), None);
    }
}
