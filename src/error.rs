use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the settlement pipeline
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Queue-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Payload kind {payload} cannot be placed on queue {queue}")]
    PayloadMismatch { queue: String, payload: String },

    #[error("Envelope {0} not found")]
    EnvelopeNotFound(Uuid),

    #[error("Envelope {id} has a malformed payload: {message}")]
    MalformedPayload { id: Uuid, message: String },
}

/// Settlement-related errors. All of them are treated as transient by the workers.
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Settlement timed out after {0:?}")]
    Timeout(Duration),

    #[error("Processor unavailable: {0}")]
    Unavailable(String),
}

/// Outbound webhook delivery errors
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Endpoint responded with status {status}")]
    Rejected { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl DeliveryError {
    /// HTTP status returned by the tenant, when one was received
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DeliveryError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
            ),
            AppError::Queue(QueueError::EnvelopeNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "ENVELOPE_NOT_FOUND",
                format!("Envelope {} not found", id),
            ),
            AppError::Queue(QueueError::UnknownQueue(name)) => (
                StatusCode::BAD_REQUEST,
                "UNKNOWN_QUEUE",
                format!("Unknown queue: {}", name),
            ),
            AppError::InvalidInput(message) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                message.clone(),
            ),
            AppError::Database(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_builder() {
            DeliveryError::InvalidEndpoint(error.to_string())
        } else {
            DeliveryError::Network(error.to_string())
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
