//! Error types shared by the services
//!
//! Database failures are split by phase so start-up can tell a bad URL from
//! an unreachable server. Inference failures distinguish transport problems
//! from answers the service gave but that could not be used.

use reqwest::StatusCode;
use sqlx::Error as SqlxError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    /// The pool could not reach the server
    #[error("Database connection error: {0}")]
    Connection(#[source] SqlxError),

    #[error("Database query error: {0}")]
    Query(#[source] SqlxError),

    #[error("Database migration error: {0}")]
    Migration(String),

    /// Missing or unparsable connection settings
    #[error("Database configuration error: {0}")]
    Configuration(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Errors returned by the inference client
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Inference configuration error: {0}")]
    Configuration(String),

    /// Network failure or timeout
    #[error("Inference request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with a non-2xx status
    #[error("Inference service returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// The body did not have the expected shape
    #[error("Malformed inference response: {0}")]
    MalformedResponse(String),
}
