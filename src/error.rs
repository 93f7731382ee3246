use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::bus::BusError;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Errors that can occur in the gateway and its services
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Too many requests: retry after {retry_after_secs}s")]
    AdmissionDenied {
        message: String,
        retry_after_secs: u64,
    },

    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Failed to decode event: {0}")]
    Decode(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GateError {
    /// HTTP status this error surfaces as. Only denial and authentication
    /// failures are distinct; CRUD lookups and validation keep 404/400.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateError::AdmissionDenied { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GateError::Validation(_) => StatusCode::BAD_REQUEST,
            GateError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            GateError::AdmissionDenied { message, .. } => message.clone(),
            GateError::Unauthenticated(msg)
            | GateError::Validation(msg)
            | GateError::NotFound(msg) => msg.clone(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "success": false,
            "message": self.public_message(),
        }));
        let mut response = (status, body).into_response();

        if let GateError::AdmissionDenied {
            retry_after_secs, ..
        } = &self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
