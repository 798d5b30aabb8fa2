//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use srake_core::{ErrorEnvelope, SrakeError};

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    envelope: ErrorEnvelope,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            envelope: ErrorEnvelope::new("bad_request", message, "Check the request parameters"),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            envelope: ErrorEnvelope::new("not_found", what, "Check the accession"),
        }
    }
}

impl From<SrakeError> for AppError {
    fn from(err: SrakeError) -> Self {
        let status = match &err {
            SrakeError::NotFound(_) => StatusCode::NOT_FOUND,
            SrakeError::InvalidAccession(_)
            | SrakeError::FieldNotAllowed(_)
            | SrakeError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            SrakeError::StoreBusy(_) | SrakeError::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            envelope: ErrorEnvelope::from(&err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}
