//! Relay error types and their HTTP mapping

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use agentmesh_core::relay::ErrorBody;

/// Error type for all relay operations. Every variant maps to one HTTP
/// status; handlers just use `?`.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Malformed input: bad username, oversized greeting, bad broadcast type
    #[error("{0}")]
    Validation(String),

    /// Missing/invalid signature or stale timestamp
    #[error("{0}")]
    Auth(String),

    /// Authenticated but not allowed: revoked agent, non-admin, wrong party
    #[error("{0}")]
    Forbidden(String),

    /// Agent, contact, group, invitation, or broadcast not found
    #[error("{0}")]
    NotFound(String),

    /// Duplicate registration or contact pair
    #[error("{0}")]
    Conflict(String),

    /// A rate limit tripped
    #[error("rate limit exceeded")]
    RateLimited {
        /// Requests left in the current window
        remaining: u32,
        /// Seconds until the window resets
        reset_secs: u64,
    },

    /// Legacy endpoint past the migration cutoff
    #[error("{0}")]
    Gone(String),

    /// SQLite failure
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Anything else
    #[error("{0}")]
    Internal(String),
}

/// Result type alias using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::Auth(_) => StatusCode::UNAUTHORIZED,
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Conflict(_) => StatusCode::CONFLICT,
            RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Gone(_) => StatusCode::GONE,
            RelayError::Sqlite(_) | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Never leak database detail to clients
        let message = match &self {
            RelayError::Sqlite(e) => {
                tracing::error!(error = %e, "Database error");
                "internal error".to_string()
            }
            RelayError::Internal(e) => {
                tracing::error!(error = %e, "Internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let mut response = (
            status,
            Json(ErrorBody { error: message }),
        )
            .into_response();

        if let RelayError::RateLimited {
            remaining,
            reset_secs,
        } = self
        {
            let headers = response.headers_mut();
            headers.insert(
                "X-RateLimit-Remaining",
                HeaderValue::from_str(&remaining.to_string()).unwrap(),
            );
            headers.insert(
                "X-RateLimit-Reset",
                HeaderValue::from_str(&reset_secs.to_string()).unwrap(),
            );
        }

        response
    }
}
