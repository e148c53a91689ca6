use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;

/// Capture subsystem error types
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to bind {addr}: {source}")]
    BindFailure {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No free port in {first}..={last} after {attempts} attempts")]
    PortExhaustion { first: u16, last: u16, attempts: u16 },

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl ResponseError for CaptureError {
    fn status_code(&self) -> StatusCode {
        match self {
            CaptureError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            CaptureError::InvalidFilter(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let error_code = match self {
            CaptureError::BindFailure { .. } => "bind_failure",
            CaptureError::PortExhaustion { .. } => "port_exhaustion",
            CaptureError::MalformedRequest(_) => "malformed_request",
            CaptureError::InvalidFilter(_) => "invalid_filter",
            CaptureError::Config(_) => "config_error",
        };

        HttpResponse::build(status).json(ErrorResponse {
            error: error_code.to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Result type alias for the capture subsystem
pub type CaptureResult<T> = Result<T, CaptureError>;
