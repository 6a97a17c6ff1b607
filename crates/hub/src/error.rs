//! Typed errors for the ingestion and provisioning paths, and their HTTP
//! mapping. Messages never carry the submitted credential.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::model::UnitId;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Unknown, absent, or revoked api key.
    #[error("unknown or missing api key")]
    Auth,

    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message returned to the device. Storage internals stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Storage(_) => "storage unavailable, retry later".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        error_body(self.status_code(), self.public_message())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("unit {0} not found")]
    NotFound(UnitId),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Conflict(String),

    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl ProvisionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ProvisionError {
    fn into_response(self) -> Response {
        let msg = match &self {
            Self::Storage(_) => "storage unavailable, retry later".to_string(),
            other => other.to_string(),
        };
        error_body(self.status_code(), msg)
    }
}

/// `{success: false, error}` with the given status.
pub fn error_body(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": error.into() })),
    )
        .into_response()
}

// ===========================================================================
// Tests
// ===========================================================================
