use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

use super::{
    ensure_supported, AuthContext, Credentials, IdentityProvider, ProviderError, ProviderKind,
    VerifiedIdentity,
};
use crate::config::StaticProviderConfig;
use crate::models::{InteractionKind, InteractionKinds, ProviderIdentity};
use crate::utils::password::verify_password;

struct StaticUser {
    password_hash: String,
    name: String,
    email: String,
    groups: BTreeSet<String>,
}

/// Fixed username/password table, loaded at startup.
pub struct StaticProvider {
    name: String,
    domain: Option<String>,
    users: HashMap<String, StaticUser>,
}

impl StaticProvider {
    pub fn from_config(config: &StaticProviderConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|(username, user)| {
                (
                    username.clone(),
                    StaticUser {
                        password_hash: user.password_hash.clone(),
                        name: user.name.clone(),
                        email: user.email.clone(),
                        groups: user.groups.iter().cloned().collect(),
                    },
                )
            })
            .collect();

        Self {
            name: config.name.clone(),
            domain: config.domain.clone(),
            users,
        }
    }

    fn asserted_username(&self, username: &str) -> String {
        match &self.domain {
            Some(domain) => format!("{}@{}", username, domain),
            None => username.to_string(),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::PasswordStatic
    }

    fn supported_interaction_kinds(&self) -> InteractionKinds {
        [InteractionKind::BrowserRedirect, InteractionKind::LegacyForm]
            .into_iter()
            .collect()
    }

    async fn authenticate(
        &self,
        _ctx: &AuthContext<'_>,
        kind: InteractionKind,
        credentials: Credentials,
    ) -> Result<VerifiedIdentity, ProviderError> {
        ensure_supported(self, kind)?;
        let Credentials::Password { username, password } = credentials else {
            return Err(ProviderError::UnsupportedInteraction(kind));
        };

        let user = self.users.get(&username);
        let matches = verify_password(&password, user.map(|u| u.password_hash.as_str()));

        let user = match user {
            Some(user) if matches => user,
            _ => {
                tracing::info!(provider = %self.name, username = %username, "static login rejected");
                return Err(ProviderError::AuthenticationFailed(format!(
                    "authentication failed for user {:?}",
                    username
                )));
            }
        };

        let mut identity = VerifiedIdentity::new(
            ProviderIdentity::new(&self.name, &username),
            self.asserted_username(&username),
        );
        identity.display_name = Some(user.name.clone()).filter(|s| !s.is_empty());
        identity.email = Some(user.email.clone()).filter(|s| !s.is_empty());
        identity.groups = Some(user.groups.clone());
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticUserConfig;
    use crate::models::WaitId;
    use crate::services::store::MemoryIdentityStore;
    use crate::utils::password::hash_password;
    use secrecy::SecretString;
    use std::collections::BTreeMap;

    fn provider(domain: Option<&str>) -> StaticProvider {
        let mut users = BTreeMap::new();
        users.insert(
            "test".to_string(),
            StaticUserConfig {
                password_hash: hash_password(&SecretString::new("testpassword".into())).unwrap(),
                name: "Test User".to_string(),
                email: String::new(),
                groups: vec!["test1".to_string(), "test2".to_string()],
            },
        );
        StaticProvider::from_config(&StaticProviderConfig {
            name: "test".to_string(),
            domain: domain.map(str::to_string),
            users,
        })
    }

    fn password(username: &str, password: &str) -> Credentials {
        Credentials::Password {
            username: username.to_string(),
            password: SecretString::new(password.to_string()),
        }
    }

    #[tokio::test]
    async fn correct_password_yields_identity() {
        let store = MemoryIdentityStore::new();
        let wait_id = WaitId::generate();
        let ctx = AuthContext { wait_id: &wait_id, store: &store };

        let identity = provider(None)
            .authenticate(&ctx, InteractionKind::LegacyForm, password("test", "testpassword"))
            .await
            .unwrap();

        assert_eq!(identity.username, "test");
        assert_eq!(identity.display_name.as_deref(), Some("Test User"));
        assert_eq!(identity.email, None);
        assert_eq!(identity.groups.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn wrong_password_names_the_user() {
        let store = MemoryIdentityStore::new();
        let wait_id = WaitId::generate();
        let ctx = AuthContext { wait_id: &wait_id, store: &store };

        let err = provider(None)
            .authenticate(&ctx, InteractionKind::BrowserRedirect, password("test", "bad"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "authentication failed for user \"test\"");

        let err = provider(None)
            .authenticate(&ctx, InteractionKind::BrowserRedirect, password("nobody", "testpassword"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn domain_is_appended_to_username() {
        let store = MemoryIdentityStore::new();
        let wait_id = WaitId::generate();
        let ctx = AuthContext { wait_id: &wait_id, store: &store };

        let identity = provider(Some("test2"))
            .authenticate(&ctx, InteractionKind::LegacyForm, password("test", "testpassword"))
            .await
            .unwrap();
        assert_eq!(identity.username, "test@test2");
        assert_eq!(identity.id.subject, "test");
    }

    #[tokio::test]
    async fn signed_requests_are_unsupported() {
        let store = MemoryIdentityStore::new();
        let wait_id = WaitId::generate();
        let ctx = AuthContext { wait_id: &wait_id, store: &store };

        let err = provider(None)
            .authenticate(&ctx, InteractionKind::SignedRequest, password("test", "testpassword"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::UnsupportedInteraction(InteractionKind::SignedRequest)
        ));
    }
}
