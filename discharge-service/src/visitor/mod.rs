//! Client side of the interaction protocols.
//!
//! A [`MultiVisitor`] holds one [`Interactor`] per kind the client can
//! drive and picks the first, in fixed priority order, that the discharger
//! offered.

mod browser;
mod client;
mod signed;

pub use browser::{LegacyFormVisitor, OpenBrowser, WebBrowserVisitor};
pub use client::{ClientError, DischargeClient};
pub use signed::{AgentSigner, OAuthSigner, RequestSigner, SignedRequestVisitor};

use async_trait::async_trait;
use reqwest::{Response, Url};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::dtos::ErrorResponse;
use crate::models::{InteractionKind, InteractionKinds};

#[derive(Debug, Error)]
pub enum VisitError {
    /// None of the offered kinds can be driven by this client. Terminal.
    #[error("method not supported: no offered interaction method is supported by this client")]
    MethodNotSupported,

    /// The discharger answered with a structured error.
    #[error("{message}")]
    Refused { code: String, message: String },

    #[error("invalid visit url {0:?}")]
    InvalidUrl(String),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl VisitError {
    /// Decode a non-success response into a structured refusal when the
    /// body has one.
    pub(crate) async fn from_response(response: Response) -> Self {
        let status = response.status();
        match response.json::<ErrorResponse>().await {
            Ok(body) => VisitError::Refused {
                code: body.code,
                message: body.message,
            },
            Err(_) => VisitError::Other(format!("unexpected response status {}", status)),
        }
    }
}

#[async_trait]
pub trait Interactor: Send + Sync {
    fn kind(&self) -> InteractionKind;

    async fn interact(&self, client: &reqwest::Client, visit_url: &Url) -> Result<(), VisitError>;
}

pub struct MultiVisitor {
    interactors: Vec<Box<dyn Interactor>>,
}

impl MultiVisitor {
    pub fn new(mut interactors: Vec<Box<dyn Interactor>>) -> Self {
        interactors.sort_by_key(|i| i.kind().priority());
        Self { interactors }
    }

    pub fn kinds(&self) -> InteractionKinds {
        self.interactors.iter().map(|i| i.kind()).collect()
    }

    /// Pick the first interactor whose kind is offered and run it. Returns
    /// the kind used.
    pub async fn visit(
        &self,
        client: &reqwest::Client,
        offered: &BTreeMap<String, String>,
    ) -> Result<InteractionKind, VisitError> {
        for interactor in &self.interactors {
            let kind = interactor.kind();
            let Some(raw) = offered.get(kind.as_str()) else {
                continue;
            };
            let url = Url::parse(raw).map_err(|_| VisitError::InvalidUrl(raw.clone()))?;
            tracing::debug!(kind = kind.as_str(), "visiting interaction url");
            interactor.interact(client, &url).await?;
            return Ok(kind);
        }
        Err(VisitError::MethodNotSupported)
    }
}
