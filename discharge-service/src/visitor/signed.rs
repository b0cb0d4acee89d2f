use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{StatusCode, Url};

use super::{Interactor, VisitError};
use crate::models::InteractionKind;
use crate::utils::oauth::{self, OAuthCredentials};
use crate::utils::signature;

/// Attaches proof of identity to an outgoing GET.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, url: &mut Url, headers: &mut HeaderMap) -> Result<(), VisitError>;
}

/// OAuth 1.0 HMAC-SHA1 signing with a consumer and an access token.
pub struct OAuthSigner {
    credentials: OAuthCredentials,
}

impl OAuthSigner {
    pub fn new(credentials: OAuthCredentials) -> Self {
        Self { credentials }
    }
}

impl RequestSigner for OAuthSigner {
    fn sign(&self, url: &mut Url, headers: &mut HeaderMap) -> Result<(), VisitError> {
        let value = oauth::authorization_header(&self.credentials, "GET", url, &[])
            .map_err(|e| VisitError::Other(format!("cannot sign request: {}", e)))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| VisitError::Other(format!("cannot sign request: {}", e)))?;
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}

/// Ed25519 agent signing: the claims and signature travel in the query.
pub struct AgentSigner {
    username: String,
    key: SigningKey,
}

impl AgentSigner {
    pub fn new(username: impl Into<String>, key: SigningKey) -> Self {
        Self {
            username: username.into(),
            key,
        }
    }
}

impl RequestSigner for AgentSigner {
    fn sign(&self, url: &mut Url, _headers: &mut HeaderMap) -> Result<(), VisitError> {
        let now = chrono::Utc::now().timestamp();
        signature::sign_url(&self.key, &self.username, "GET", url, now);
        Ok(())
    }
}

/// Drives the signed-request interaction: one signed GET of the visit URL.
pub struct SignedRequestVisitor<S> {
    signer: S,
}

impl<S: RequestSigner> SignedRequestVisitor<S> {
    pub fn new(signer: S) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl<S: RequestSigner> Interactor for SignedRequestVisitor<S> {
    fn kind(&self) -> InteractionKind {
        InteractionKind::SignedRequest
    }

    async fn interact(&self, client: &reqwest::Client, visit_url: &Url) -> Result<(), VisitError> {
        let mut url = visit_url.clone();
        let mut headers = HeaderMap::new();
        self.signer.sign(&mut url, &mut headers)?;

        let response = client.get(url).headers(headers).send().await?;
        if response.status() == StatusCode::OK {
            return Ok(());
        }
        Err(VisitError::from_response(response).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn oauth_signer_sets_authorization_header() {
        let signer = OAuthSigner::new(
            OAuthCredentials::consumer("1234", SecretString::new("secret1".to_string()))
                .with_token("test-token", SecretString::new("secret2".to_string())),
        );
        let mut url = Url::parse("http://idm.example/login/oauth/signed?waitid=abc").unwrap();
        let mut headers = HeaderMap::new();
        signer.sign(&mut url, &mut headers).unwrap();

        let value = headers[AUTHORIZATION].to_str().unwrap();
        let params = oauth::parse_authorization_header(value).unwrap();
        assert_eq!(params["oauth_consumer_key"], "1234");
        assert_eq!(params["oauth_token"], "test-token");
        assert!(oauth::verify("GET", &url, &params, &[], "secret1", Some("secret2")));
        assert_eq!(url.query(), Some("waitid=abc"));
    }

    #[test]
    fn agent_signer_signs_the_query() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let signer = AgentSigner::new("bob", key);
        let mut url = Url::parse("http://idm.example/login/legacy-agent?waitid=abc").unwrap();
        signer.sign(&mut url, &mut HeaderMap::new()).unwrap();

        let claim = signature::verify_url("GET", &url, chrono::Utc::now().timestamp()).unwrap();
        assert_eq!(claim.username, "bob");
    }
}
