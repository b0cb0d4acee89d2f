use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use reqwest::{StatusCode, Url};
use std::collections::BTreeMap;
use thiserror::Error;

use super::{MultiVisitor, VisitError};
use crate::dtos::{DischargeResponse, ErrorResponse};
use crate::handlers::discharge::INTERACTION_KINDS_HEADER;
use crate::models::Macaroon;

const INTERACTION_REQUIRED: &str = "interaction required";
const METHOD_NOT_SUPPORTED: &str = "method not supported";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot acquire discharge token: {message}")]
    Refused { code: String, message: String },

    #[error("failed to acquire macaroon after waiting: third party refused discharge: {message}")]
    LegacyRefused { code: String, message: String },

    #[error("cannot start interactive session: {0}")]
    Visit(#[from] VisitError),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Machine code reported by the discharger, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Refused { code, .. } | ClientError::LegacyRefused { code, .. } => {
                Some(code.as_str())
            }
            ClientError::Visit(VisitError::Refused { code, .. }) => Some(code.as_str()),
            ClientError::Visit(VisitError::MethodNotSupported) => Some(METHOD_NOT_SUPPORTED),
            _ => None,
        }
    }

    fn refused(legacy: bool, body: ErrorResponse) -> Self {
        if legacy {
            ClientError::LegacyRefused {
                code: body.code,
                message: body.message,
            }
        } else {
            ClientError::Refused {
                code: body.code,
                message: body.message,
            }
        }
    }
}

/// Acquires discharge macaroons: discharge, interact if asked, then wait.
pub struct DischargeClient {
    http: reqwest::Client,
    location: String,
    visitor: MultiVisitor,
}

impl DischargeClient {
    /// `location` is the discharger's base URL, as it puts in caveats.
    pub fn new(http: reqwest::Client, location: impl Into<String>, visitor: MultiVisitor) -> Self {
        Self {
            http,
            location: location.into().trim_end_matches('/').to_string(),
            visitor,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.location, path)
    }

    pub async fn discharge(&self, caveat_id: &[u8]) -> Result<Macaroon, ClientError> {
        let kinds = self
            .visitor
            .kinds()
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let response = self
            .http
            .post(self.endpoint("discharge"))
            .header(INTERACTION_KINDS_HEADER, kinds)
            .form(&[("id", URL_SAFE_NO_PAD.encode(caveat_id))])
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(response.json::<DischargeResponse>().await?.macaroon);
        }

        let body = read_error(response).await?;
        let Some(info) = body.info.clone().filter(|_| body.code == INTERACTION_REQUIRED) else {
            return Err(ClientError::refused(false, body));
        };

        let wait_url = Url::parse(&info.wait_url)
            .map_err(|_| ClientError::Protocol(format!("invalid wait url {:?}", info.wait_url)))?;
        let legacy = wait_url.path().ends_with("/wait");

        let kind = self.visitor.visit(&self.http, &info.interaction_methods).await?;
        tracing::debug!(kind = kind.as_str(), wait_id = %info.wait_id, "interaction done, waiting");

        let response = self.http.get(wait_url).send().await?;
        if response.status() == StatusCode::OK {
            return Ok(response.json::<DischargeResponse>().await?.macaroon);
        }
        Err(ClientError::refused(legacy, read_error(response).await?))
    }

    /// Fetch the headless login methods the discharger offers.
    pub async fn login_methods(&self) -> Result<BTreeMap<String, String>, ClientError> {
        let response = self.http.get(self.endpoint("login-legacy")).send().await?;
        if response.status() != StatusCode::OK {
            return Err(ClientError::refused(false, read_error(response).await?));
        }
        Ok(response.json().await?)
    }
}

async fn read_error(response: reqwest::Response) -> Result<ErrorResponse, ClientError> {
    let status = response.status();
    response
        .json::<ErrorResponse>()
        .await
        .map_err(|_| ClientError::Protocol(format!("status {} without error body", status)))
}
