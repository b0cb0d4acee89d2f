use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use service_core::error::AppError;
use service_core::observability::inject_trace_context;
use std::time::Duration;

use super::{
    ensure_supported, AuthContext, Credentials, IdentityProvider, ProviderError, ProviderKind,
    SignedRequest, VerifiedIdentity,
};
use crate::config::OAuthProviderConfig;
use crate::models::{InteractionKind, InteractionKinds, ProviderIdentity};
use crate::utils::oauth::{authorization_header, parse_authorization_header, OAuthCredentials};

/// `extra_info` key caching the client's OAuth token key.
pub const OAUTH_TOKEN: &str = "oauth-token";

const VALIDATE_PATH: &str = "/api/v2/requests/validate";

/// Delegates verification of OAuth-signed requests to an upstream SSO.
///
/// The client's signed request is forwarded verbatim; the upstream checks
/// the signature against the secrets it issued and returns the account.
pub struct OAuthProvider {
    name: String,
    domain: Option<String>,
    validate_url: Url,
    credentials: OAuthCredentials,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    is_valid: bool,
    #[serde(default)]
    account: Option<Account>,
}

#[derive(Debug, Deserialize)]
struct Account {
    openid: String,
    username: String,
    #[serde(default)]
    displayname: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    groups: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamError {
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

impl OAuthProvider {
    pub fn from_config(config: &OAuthProviderConfig, http: reqwest::Client) -> Result<Self, AppError> {
        let base = Url::parse(&config.upstream_url).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!(
                "provider {:?}: invalid upstream_url: {}",
                config.name,
                e
            ))
        })?;
        let validate_url = base.join(VALIDATE_PATH).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("provider {:?}: {}", config.name, e))
        })?;

        Ok(Self {
            name: config.name.clone(),
            domain: config.domain.clone(),
            validate_url,
            credentials: OAuthCredentials::consumer(
                config.consumer_key.clone(),
                config.consumer_secret.clone(),
            ),
            timeout: Duration::from_secs(config.timeout_seconds),
            http,
        })
    }

    async fn validate(
        &self,
        request: &SignedRequest,
        authorization: &str,
    ) -> Result<Account, ProviderError> {
        let form = vec![
            ("http_url".to_string(), request.url.to_string()),
            ("http_method".to_string(), request.method.clone()),
            ("authorization".to_string(), authorization.to_string()),
        ];
        let header = authorization_header(&self.credentials, "POST", &self.validate_url, &form)
            .map_err(|e| ProviderError::ProviderUnavailable(e.to_string()))?;
        let mut headers = reqwest::header::HeaderMap::new();
        inject_trace_context(&mut headers);

        let response = self
            .http
            .post(self.validate_url.clone())
            .headers(headers)
            .header(reqwest::header::AUTHORIZATION, header)
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(provider = %self.name, error = %e, "upstream validation request failed");
                let reason = if e.is_timeout() {
                    "timed out contacting identity provider"
                } else {
                    "cannot contact identity provider"
                };
                ProviderError::ProviderUnavailable(reason.to_string())
            })?;

        let status = response.status();
        if status.is_client_error() {
            let body: UpstreamError = response.json().await.unwrap_or_default();
            return Err(ProviderError::AuthenticationFailed(
                body.message
                    .unwrap_or_else(|| format!("identity provider refused request ({})", status)),
            ));
        }
        if status != StatusCode::OK {
            tracing::warn!(provider = %self.name, %status, "unexpected upstream status");
            return Err(ProviderError::ProviderUnavailable(format!(
                "identity provider returned {}",
                status
            )));
        }

        let body: ValidateResponse = response.json().await.map_err(|e| {
            ProviderError::ProviderUnavailable(format!("invalid identity provider response: {}", e))
        })?;

        match body {
            ValidateResponse {
                is_valid: true,
                account: Some(account),
            } => Ok(account),
            _ => Err(ProviderError::AuthenticationFailed(
                "invalid OAuth credentials".to_string(),
            )),
        }
    }
}

#[async_trait]
impl IdentityProvider for OAuthProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OAuthDelegated
    }

    fn supported_interaction_kinds(&self) -> InteractionKinds {
        [InteractionKind::SignedRequest].into_iter().collect()
    }

    async fn authenticate(
        &self,
        _ctx: &AuthContext<'_>,
        kind: InteractionKind,
        credentials: Credentials,
    ) -> Result<VerifiedIdentity, ProviderError> {
        ensure_supported(self, kind)?;
        let Credentials::Signed(request) = credentials else {
            return Err(ProviderError::UnsupportedInteraction(kind));
        };
        let authorization = request
            .authorization
            .as_deref()
            .ok_or_else(|| ProviderError::AuthenticationFailed("missing OAuth authorization".to_string()))?;
        let oauth_params = parse_authorization_header(authorization).ok_or_else(|| {
            ProviderError::AuthenticationFailed("malformed OAuth authorization".to_string())
        })?;

        let account = self.validate(&request, authorization).await?;
        tracing::debug!(provider = %self.name, subject = %account.openid, "upstream accepted request");

        let mut identity = VerifiedIdentity::new(
            ProviderIdentity::new(&self.name, account.openid),
            account.username,
        );
        identity.display_name = account.displayname;
        identity.email = account.email;
        identity.groups = account.groups.map(|g| g.into_iter().collect());
        if let Some(token) = oauth_params.get("oauth_token") {
            identity
                .extra_info
                .insert(OAUTH_TOKEN.to_string(), token.as_bytes().to_vec());
        }
        Ok(identity)
    }
}
