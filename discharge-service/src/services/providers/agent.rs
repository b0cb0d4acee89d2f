use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use service_core::error::AppError;

use super::{
    ensure_supported, AuthContext, Credentials, IdentityProvider, ProviderError, ProviderKind,
    VerifiedIdentity,
};
use crate::config::AgentProviderConfig;
use crate::models::{InteractionKind, InteractionKinds, ProviderIdentity};
use crate::services::store::StoreError;
use crate::utils::signature::{decode_public_key, encode_public_key, verify_url};

/// Identity asserted for the configured administrative key.
pub const ADMIN_USERNAME: &str = "admin@idm";

/// `extra_info` key holding an agent's base64url Ed25519 public key.
pub const AGENT_PUBLIC_KEY: &str = "agent-public-key";

/// Headless login: the client signs the visit URL with a provisioned key.
/// No upstream is contacted; keys are resolved against the identity store.
pub struct AgentProvider {
    name: String,
    admin_key: Option<VerifyingKey>,
}

impl AgentProvider {
    pub fn from_config(config: &AgentProviderConfig) -> Result<Self, AppError> {
        let admin_key = config
            .admin_public_key
            .as_deref()
            .map(decode_public_key)
            .transpose()
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!(
                    "provider {:?}: admin_public_key: {}",
                    config.name,
                    e
                ))
            })?;

        Ok(Self {
            name: config.name.clone(),
            admin_key,
        })
    }

    fn denied(username: &str) -> ProviderError {
        ProviderError::AuthenticationFailed(format!("authentication failed for user {:?}", username))
    }
}

#[async_trait]
impl IdentityProvider for AgentProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Agent
    }

    fn supported_interaction_kinds(&self) -> InteractionKinds {
        [InteractionKind::SignedRequest].into_iter().collect()
    }

    async fn authenticate(
        &self,
        ctx: &AuthContext<'_>,
        kind: InteractionKind,
        credentials: Credentials,
    ) -> Result<VerifiedIdentity, ProviderError> {
        ensure_supported(self, kind)?;
        let Credentials::Signed(request) = credentials else {
            return Err(ProviderError::UnsupportedInteraction(kind));
        };

        // The signature must cover this login attempt, not some other one.
        let bound = request
            .url
            .query_pairs()
            .any(|(k, v)| k == "waitid" && v == ctx.wait_id.as_str());
        if !bound {
            return Err(ProviderError::AuthenticationFailed(
                "signed request is not bound to this login".to_string(),
            ));
        }

        let claim = verify_url(&request.method, &request.url, chrono::Utc::now().timestamp())
            .map_err(|e| ProviderError::AuthenticationFailed(format!("agent login failed: {}", e)))?;

        if self.admin_key.as_ref() == Some(&claim.public_key) {
            if claim.username != ADMIN_USERNAME {
                return Err(Self::denied(&claim.username));
            }
            tracing::info!(provider = %self.name, "administrative agent login");
            let mut identity = VerifiedIdentity::new(
                ProviderIdentity::new(&self.name, ADMIN_USERNAME),
                ADMIN_USERNAME,
            );
            identity.admin = true;
            return Ok(identity);
        }

        let id = ProviderIdentity::new(&self.name, &claim.username);
        let record = match ctx.store.find_by_provider_id(&id).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => return Err(Self::denied(&claim.username)),
            Err(e) => return Err(e.into()),
        };

        let expected = encode_public_key(&claim.public_key);
        let provisioned = record
            .extra_info
            .get(AGENT_PUBLIC_KEY)
            .map(|k| k.as_slice() == expected.as_bytes())
            .unwrap_or(false);
        if !provisioned {
            return Err(Self::denied(&claim.username));
        }

        Ok(VerifiedIdentity::new(id, record.username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IdentityUpdate, WaitId};
    use crate::services::providers::SignedRequest;
    use crate::services::store::{IdentityStore, MemoryIdentityStore};
    use crate::utils::signature::sign_url;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use reqwest::Url;

    fn signed(key: &SigningKey, username: &str, wait_id: &WaitId) -> Credentials {
        let mut url = Url::parse("http://idm.example/login/agent/signed").unwrap();
        url.query_pairs_mut().append_pair("waitid", wait_id.as_str());
        sign_url(key, username, "GET", &mut url, chrono::Utc::now().timestamp());
        Credentials::Signed(SignedRequest {
            method: "GET".to_string(),
            url,
            authorization: None,
        })
    }

    fn provider(admin: Option<&SigningKey>) -> AgentProvider {
        AgentProvider::from_config(&AgentProviderConfig {
            name: "agent".to_string(),
            admin_public_key: admin.map(|k| encode_public_key(&k.verifying_key())),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn admin_key_yields_admin_identity() {
        let admin = SigningKey::generate(&mut OsRng);
        let store = MemoryIdentityStore::new();
        let wait_id = WaitId::generate();
        let ctx = AuthContext { wait_id: &wait_id, store: &store };

        let identity = provider(Some(&admin))
            .authenticate(&ctx, InteractionKind::SignedRequest, signed(&admin, ADMIN_USERNAME, &wait_id))
            .await
            .unwrap();
        assert!(identity.admin);
        assert_eq!(identity.username, ADMIN_USERNAME);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn provisioned_key_resolves_against_store() {
        let key = SigningKey::generate(&mut OsRng);
        let store = MemoryIdentityStore::new();
        store
            .upsert_attributes(
                &ProviderIdentity::new("agent", "bot"),
                IdentityUpdate::new()
                    .username("bot")
                    .extra_info(AGENT_PUBLIC_KEY, encode_public_key(&key.verifying_key())),
            )
            .await
            .unwrap();
        let wait_id = WaitId::generate();
        let ctx = AuthContext { wait_id: &wait_id, store: &store };

        let identity = provider(None)
            .authenticate(&ctx, InteractionKind::SignedRequest, signed(&key, "bot", &wait_id))
            .await
            .unwrap();
        assert!(!identity.admin);
        assert_eq!(identity.username, "bot");

        let stranger = SigningKey::generate(&mut OsRng);
        let err = provider(None)
            .authenticate(&ctx, InteractionKind::SignedRequest, signed(&stranger, "bot", &wait_id))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "authentication failed for user \"bot\"");
    }

    #[tokio::test]
    async fn signature_for_another_login_is_refused() {
        let admin = SigningKey::generate(&mut OsRng);
        let store = MemoryIdentityStore::new();
        let wait_id = WaitId::generate();
        let other = WaitId::generate();
        let ctx = AuthContext { wait_id: &wait_id, store: &store };

        let err = provider(Some(&admin))
            .authenticate(&ctx, InteractionKind::SignedRequest, signed(&admin, ADMIN_USERNAME, &other))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
    }
}
