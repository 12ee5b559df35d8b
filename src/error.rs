//! Portal error type shared by every component.
//!
//! Remote failures are fatal for the request that hit them, validation
//! failures are shown back to the user, and a missing patient is a plain
//! recoverable lookup miss.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("Records API returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Unexpected records API response: {0}")]
    UnexpectedResponse(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Not authenticated with the records API")]
    NotAuthenticated,

    #[error("Missing or unknown session")]
    InvalidSession,

    #[error("OAuth state mismatch")]
    StateMismatch,

    #[error("{0}")]
    Validation(String),

    #[error("Patient not found: {0}")]
    PatientNotFound(i64),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type PortalResult<T> = Result<T, PortalError>;

impl PortalError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PortalError::Upstream { .. } | PortalError::Network(_) => StatusCode::BAD_GATEWAY,
            PortalError::Json(_) | PortalError::UnexpectedResponse(_) => StatusCode::BAD_GATEWAY,
            PortalError::Database(_) | PortalError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PortalError::NotAuthenticated | PortalError::InvalidSession => StatusCode::UNAUTHORIZED,
            PortalError::StateMismatch => StatusCode::BAD_REQUEST,
            PortalError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PortalError::PatientNotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for PortalError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() || status == StatusCode::BAD_GATEWAY {
            tracing::error!(status = status.as_u16(), "Request failed: {}", self);
        } else {
            tracing::debug!(status = status.as_u16(), "Request rejected: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
