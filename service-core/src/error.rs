use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Infrastructure-level failures shared by the service binaries.
///
/// Domain errors live in the service crates and convert into this type only
/// when they have to cross into infrastructure code (startup, middleware).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("Too many requests: {0}")]
    TooManyRequests(String, Option<u64>),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

/// Wire shape of every error body: a stable machine code plus a message.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "Code")]
    pub code: &'static str,
    #[serde(rename = "Message")]
    pub message: String,
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad request",
            AppError::NotFound(_) => "not found",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::TooManyRequests(..) => "too many requests",
            AppError::ServiceUnavailable => "service unavailable",
            AppError::InternalError(_) | AppError::DatabaseError(_) | AppError::ConfigError(_) => {
                "internal error"
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::TooManyRequests(..) => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError(_) | AppError::DatabaseError(_) | AppError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        // Internal details go to the log, not to the client.
        let (message, retry_after) = match &self {
            AppError::BadRequest(err) | AppError::NotFound(err) | AppError::Unauthorized(err) => {
                (err.to_string(), None)
            }
            AppError::TooManyRequests(msg, retry) => (msg.clone(), *retry),
            AppError::ServiceUnavailable => ("service unavailable".to_string(), None),
            AppError::InternalError(err)
            | AppError::DatabaseError(err)
            | AppError::ConfigError(err) => {
                tracing::error!(error = %err, code, "request failed");
                ("internal server error".to_string(), None)
            }
        };

        let mut res = (status, Json(ErrorBody { code, message })).into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}
