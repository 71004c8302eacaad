// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types with consistent API responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Push notification failed the authenticity checks.
    #[error("Push notification rejected: {0}")]
    Authenticity(String),

    /// No OAuth credential is stored for the user.
    #[error("No OAuth credential stored for user {0}")]
    NoCredential(String),

    /// The identity provider rejected the refresh token.
    #[error("Token refresh rejected: {0}")]
    RefreshFailed(String),

    /// The mail provider rejected the watch subscription.
    #[error("Watch registration failed: {0}")]
    WatchRegistration(String),

    /// A message could not be turned into a transaction.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The parser service could not be reached or failed server-side.
    #[error("Parser unavailable: {0}")]
    ParserUnavailable(String),

    #[error("Google API error: {0}")]
    GoogleApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Marker for HTTP 429 from Google.
    pub const GOOGLE_RATE_LIMIT: &'static str = "Rate limit exceeded";
    /// Marker for HTTP 401 from Google (access token rejected).
    pub const GOOGLE_TOKEN_ERROR: &'static str = "Access token rejected";
    /// Marker for a `history.list` start cursor that Gmail no longer has.
    pub const HISTORY_EXPIRED: &'static str = "History ID not found or too old";

    /// True when the same call may succeed later.
    ///
    /// A message that failed this way must be fetched again, so the
    /// history cursor is not moved past it.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AppError::GoogleApi(_)
                | AppError::ParserUnavailable(_)
                | AppError::Database(_)
                | AppError::Internal(_)
        )
    }

    /// True when Google rejected the access token itself.
    pub fn is_google_token_error(&self) -> bool {
        matches!(self, AppError::GoogleApi(msg) if msg == Self::GOOGLE_TOKEN_ERROR)
    }

    /// True when `history.list` reported the start cursor as expired.
    pub fn is_history_expired(&self) -> bool {
        matches!(self, AppError::GoogleApi(msg) if msg == Self::HISTORY_EXPIRED)
    }
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    /// HTTP status, public error code and optional details.
    fn parts(&self) -> (StatusCode, &'static str, Option<String>) {
        match self {
            AppError::Unauthorized | AppError::Authenticity(_) => {
                (StatusCode::UNAUTHORIZED, "Unauthorized", None)
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.clone())),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone()))
            }
            AppError::NoCredential(_) => (StatusCode::CONFLICT, "not_connected", None),
            AppError::RefreshFailed(_) => (StatusCode::CONFLICT, "needs_reauth", None),
            AppError::WatchRegistration(msg) => (
                StatusCode::BAD_GATEWAY,
                "watch_registration_failed",
                Some(msg.clone()),
            ),
            AppError::GoogleApi(msg) => {
                (StatusCode::BAD_GATEWAY, "google_error", Some(msg.clone()))
            }
            AppError::Parse(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "parse_error",
                Some(msg.clone()),
            ),
            AppError::ParserUnavailable(_) => {
                (StatusCode::BAD_GATEWAY, "parser_unavailable", None)
            }
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    /// Public error code, safe to show to clients.
    pub fn code(&self) -> &'static str {
        self.parts().1
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(msg) => tracing::error!(error = %msg, "Database error"),
            AppError::Internal(err) => tracing::error!(error = %err, "Internal server error"),
            _ => {}
        }

        let (status, error, details) = self.parts();

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
