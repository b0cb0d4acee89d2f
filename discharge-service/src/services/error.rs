use service_core::axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::AppError;
use thiserror::Error;

use super::bakery::BakeryError;
use super::providers::ProviderError;
use super::sessions::SessionError;
use super::store::StoreError;
use crate::dtos::{ErrorResponse, InteractionInfo};
use crate::models::ConditionError;

/// Everything a discharge exchange can end with other than a macaroon.
///
/// Each variant has a stable wire code so automated clients can branch on
/// it. Messages never carry credential material.
#[derive(Error, Debug)]
pub enum DischargeError {
    #[error("{0}")]
    AuthenticationFailed(String),

    #[error("method not supported: {0}")]
    MethodNotSupported(String),

    #[error("interaction kind {0} not supported")]
    UnsupportedInteraction(String),

    #[error("identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("no usable identity provider: {0}")]
    NoUsableProvider(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("timed out waiting for login")]
    Timeout,

    #[error("{0}")]
    BadRequest(String),

    #[error("interaction required")]
    InteractionRequired(Box<InteractionInfo>),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DischargeError {
    pub fn code(&self) -> &'static str {
        match self {
            DischargeError::AuthenticationFailed(_) => "authentication failed",
            DischargeError::MethodNotSupported(_) => "method not supported",
            DischargeError::UnsupportedInteraction(_) => "unsupported interaction",
            DischargeError::ProviderUnavailable(_) => "provider unavailable",
            DischargeError::NoUsableProvider(_) => "no usable provider",
            DischargeError::NotFound(_) => "not found",
            DischargeError::Conflict(_) => "already exists",
            DischargeError::Timeout => "timeout",
            DischargeError::BadRequest(_) => "bad request",
            DischargeError::InteractionRequired(_) => "interaction required",
            DischargeError::Internal(_) => "internal error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DischargeError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            DischargeError::InteractionRequired(_) => StatusCode::UNAUTHORIZED,
            DischargeError::MethodNotSupported(_)
            | DischargeError::UnsupportedInteraction(_)
            | DischargeError::NoUsableProvider(_)
            | DischargeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DischargeError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            DischargeError::NotFound(_) => StatusCode::NOT_FOUND,
            DischargeError::Conflict(_) => StatusCode::CONFLICT,
            DischargeError::Timeout => StatusCode::REQUEST_TIMEOUT,
            DischargeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to the caller.
    pub fn public_message(&self) -> String {
        match self {
            DischargeError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for DischargeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => DischargeError::NotFound(format!("identity {} not found", id)),
            StoreError::Conflict(username) => {
                DischargeError::Conflict(format!("username {:?} already in use", username))
            }
            StoreError::Database(e) => DischargeError::Internal(anyhow::Error::new(e)),
            StoreError::Internal(e) => DischargeError::Internal(e),
        }
    }
}

impl From<ProviderError> for DischargeError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::AuthenticationFailed(reason) => DischargeError::AuthenticationFailed(reason),
            ProviderError::UnsupportedInteraction(kind) => {
                DischargeError::UnsupportedInteraction(kind.to_string())
            }
            ProviderError::ProviderUnavailable(reason) => DischargeError::ProviderUnavailable(reason),
            ProviderError::Store(e) => e.into(),
        }
    }
}

impl From<SessionError> for DischargeError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => DischargeError::NotFound(format!("wait id {} not found", id)),
            SessionError::Timeout => DischargeError::Timeout,
        }
    }
}

impl From<BakeryError> for DischargeError {
    fn from(err: BakeryError) -> Self {
        match err {
            BakeryError::InvalidCaveat(reason) => DischargeError::BadRequest(reason),
            BakeryError::Condition(e) => e.into(),
            BakeryError::Mint(reason) => DischargeError::Internal(anyhow::anyhow!(reason)),
        }
    }
}

impl From<ConditionError> for DischargeError {
    fn from(err: ConditionError) -> Self {
        DischargeError::BadRequest(err.to_string())
    }
}

impl From<AppError> for DischargeError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::BadRequest(e) => DischargeError::BadRequest(e.to_string()),
            AppError::NotFound(e) => DischargeError::NotFound(e.to_string()),
            AppError::Unauthorized(e) => DischargeError::AuthenticationFailed(e.to_string()),
            other => DischargeError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl IntoResponse for DischargeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        if let DischargeError::Internal(err) = &self {
            tracing::error!(error = %err, code, "discharge failed");
        }

        let message = self.public_message();
        let info = match self {
            DischargeError::InteractionRequired(info) => Some(*info),
            _ => None,
        };

        (
            status,
            Json(ErrorResponse {
                code: code.to_string(),
                message,
                info,
            }),
        )
            .into_response()
    }
}
