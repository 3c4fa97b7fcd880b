//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tether_engine::{Key, StoreName, Version};

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("CouchDB request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CouchDB error: {0}")]
    CouchDb(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] tether_engine::Error),

    #[error("Version conflict on {store}/{key}: expected version {expected}, got {found}")]
    VersionConflict {
        store: StoreName,
        key: Key,
        expected: Version,
        found: Version,
    },

    #[error("Unknown key in store '{store}': {key}")]
    UnknownKey { store: StoreName, key: Key },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,
}

impl AppError {
    /// Whether the error is a refusal of the client's change rather than a server fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AppError::VersionConflict { .. } | AppError::UnknownKey { .. } | AppError::BadRequest(_)
        )
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                    None,
                )
            }
            AppError::Migration(e) => {
                tracing::error!("Migration error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                    None,
                )
            }
            AppError::Http(_) | AppError::CouchDb(_) => {
                tracing::error!("Backend error: {}", self);
                (
                    StatusCode::BAD_GATEWAY,
                    "Backend unavailable".to_string(),
                    Some(self.to_string()),
                )
            }
            AppError::Json(e) => {
                tracing::error!("Stored change is unreadable: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Engine(e) => {
                tracing::warn!("Engine error: {:?}", e);
                (StatusCode::BAD_REQUEST, e.to_string(), None)
            }
            AppError::VersionConflict { .. } => (StatusCode::CONFLICT, self.to_string(), None),
            AppError::UnknownKey { .. } => (StatusCode::NOT_FOUND, self.to_string(), None),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
