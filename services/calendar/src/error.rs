//! Error types for the calendar service

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use reqwest::StatusCode as UpstreamStatus;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Booking ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    /// No inventory left for the requested range
    #[error("No availability for room type {room_type_id} in the selected period")]
    NoAvailability { room_type_id: Uuid },

    #[error("Room type not found: {0}")]
    RoomTypeNotFound(Uuid),

    #[error("Booking not found: {0}")]
    NotFound(Uuid),

    /// The requested transition is not allowed
    #[error("Booking conflict: {0}")]
    Conflict(String),

    #[error("Invalid booking: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Google Calendar errors
#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("Calendar configuration error: {0}")]
    Configuration(String),

    /// Refresh token exchange failed
    #[error("Calendar authorization failed: {0}")]
    Auth(String),

    #[error("Calendar request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Calendar API returned {status}: {body}")]
    Status {
        status: UpstreamStatus,
        body: String,
    },

    #[error("Malformed calendar response: {0}")]
    Malformed(String),

    /// The hotel owner has not connected a calendar
    #[error("User {0} has no Google Calendar integration")]
    NotIntegrated(Uuid),
}

/// Custom error type for the HTTP API
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Ledger(LedgerError::NoAvailability { .. })
            | ApiError::Ledger(LedgerError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Ledger(LedgerError::NotFound(_))
            | ApiError::Ledger(LedgerError::RoomTypeNotFound(_))
            | ApiError::Calendar(CalendarError::NotIntegrated(_)) => StatusCode::NOT_FOUND,
            ApiError::Ledger(LedgerError::Invalid(_)) => StatusCode::BAD_REQUEST,
            ApiError::Calendar(CalendarError::Auth(_) | CalendarError::Status { .. }) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let error_message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {:?}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Type alias for API results
pub type ApiResult<T> = Result<T, ApiError>;
