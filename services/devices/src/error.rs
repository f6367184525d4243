//! Error types for the device service

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors raised while managing device connections
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No pairing code or connection within the pairing window
    #[error("Timed out waiting for the pairing code")]
    PairingTimeout,

    /// The phone that authenticated is not the registered one
    #[error("Scanned number {actual} does not match the registered number {expected}")]
    IdentityMismatch { expected: String, actual: String },

    /// The device logged out while connecting
    #[error("Device was logged out")]
    LoggedOut,

    /// The connection went away before the device was ready
    #[error("Connection closed before the device was ready")]
    ConnectionClosed,

    /// A persisted session is missing one of its artifacts
    #[error("Invalid session {0}: {1}")]
    SessionInvalid(String, String),

    /// The device configuration cannot be used
    #[error("Invalid device configuration: {0}")]
    InvalidConfig(String),

    /// No such device in the registry
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The device exists but is not connected
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// Session storage I/O failure
    #[error("Session storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Session descriptor or credentials could not be (de)serialized
    #[error("Session serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Messaging protocol failure
    #[error("Messaging protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The pairing code could not be rendered
    #[error("Pairing code rendering failed: {0}")]
    Pairing(String),
}

/// Custom error type for the HTTP API
#[derive(Error, Debug)]
pub enum ApiError {
    /// Bad request with message
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Device failure
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Device(err) => {
                let status = match err {
                    DeviceError::PairingTimeout => StatusCode::GATEWAY_TIMEOUT,
                    DeviceError::IdentityMismatch { .. } | DeviceError::LoggedOut => {
                        StatusCode::CONFLICT
                    }
                    DeviceError::NotFound(_) => StatusCode::NOT_FOUND,
                    DeviceError::NotConnected(_) | DeviceError::ConnectionClosed => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    DeviceError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Type alias for API results
pub type ApiResult<T> = Result<T, ApiError>;
