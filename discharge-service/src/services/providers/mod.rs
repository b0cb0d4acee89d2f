//! Pluggable identity providers.
//!
//! Every backend sits behind [`IdentityProvider`]; the orchestrator picks
//! one by intersecting interaction kinds, never by inspecting its type.

mod agent;
mod oauth;
mod static_provider;

pub use agent::{AgentProvider, ADMIN_USERNAME, AGENT_PUBLIC_KEY};
pub use oauth::{OAuthProvider, OAUTH_TOKEN};
pub use static_provider::StaticProvider;

use async_trait::async_trait;
use reqwest::Url;
use secrecy::SecretString;
use service_core::error::AppError;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;

use super::store::{IdentityStore, StoreError};
use crate::config::ProviderConfig;
use crate::models::{IdentityUpdate, InteractionKind, InteractionKinds, ProviderIdentity, WaitId};

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Bad credentials. The reason is shown to the user.
    #[error("{0}")]
    AuthenticationFailed(String),

    #[error("interaction kind {0} not supported")]
    UnsupportedInteraction(InteractionKind),

    /// Upstream or configuration failure; the client may retry.
    #[error("{0}")]
    ProviderUnavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    PasswordStatic,
    OAuthDelegated,
    Agent,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::PasswordStatic => "password-static",
            ProviderKind::OAuthDelegated => "oauth-delegated",
            ProviderKind::Agent => "agent",
        }
    }
}

/// Per-attempt context handed to a provider.
pub struct AuthContext<'a> {
    pub wait_id: &'a WaitId,
    pub store: &'a dyn IdentityStore,
}

/// A request signed by the client, as received by the discharger.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: String,
    /// Full public URL the client signed, query included.
    pub url: Url,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Credentials {
    Password {
        username: String,
        password: SecretString,
    },
    Signed(SignedRequest),
}

/// What a provider vouches for at the moment of authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
    pub id: ProviderIdentity,
    pub username: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    /// `None` leaves the stored groups untouched.
    pub groups: Option<BTreeSet<String>>,
    pub extra_info: BTreeMap<String, Vec<u8>>,
    /// The fixed administrative identity; never persisted.
    pub admin: bool,
}

impl VerifiedIdentity {
    pub fn new(id: ProviderIdentity, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            display_name: None,
            email: None,
            groups: None,
            extra_info: BTreeMap::new(),
            admin: false,
        }
    }

    pub fn attribute_update(&self) -> IdentityUpdate {
        IdentityUpdate {
            username: Some(self.username.clone()),
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            groups: self.groups.clone(),
            extra_info: self.extra_info.clone(),
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Domain served by this provider; `None` serves undomained requests.
    fn domain(&self) -> Option<&str> {
        None
    }

    fn kind(&self) -> ProviderKind;

    fn supported_interaction_kinds(&self) -> InteractionKinds;

    async fn authenticate(
        &self,
        ctx: &AuthContext<'_>,
        kind: InteractionKind,
        credentials: Credentials,
    ) -> Result<VerifiedIdentity, ProviderError>;
}

fn ensure_supported(
    provider: &dyn IdentityProvider,
    kind: InteractionKind,
) -> Result<(), ProviderError> {
    if provider.supported_interaction_kinds().contains(&kind) {
        Ok(())
    } else {
        Err(ProviderError::UnsupportedInteraction(kind))
    }
}

/// Explicit, immutable set of configured providers in configuration order.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn IdentityProvider>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn IdentityProvider>>) -> Result<Self, AppError> {
        let mut names = HashSet::new();
        for provider in &providers {
            if !names.insert(provider.name().to_string()) {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "duplicate identity provider name {:?}",
                    provider.name()
                )));
            }
        }
        Ok(Self { providers })
    }

    pub fn from_config(configs: &[ProviderConfig], http: reqwest::Client) -> Result<Self, AppError> {
        let providers = configs
            .iter()
            .map(|config| -> Result<Arc<dyn IdentityProvider>, AppError> {
                Ok(match config {
                    ProviderConfig::Static(c) => Arc::new(StaticProvider::from_config(c)),
                    ProviderConfig::OAuth(c) => Arc::new(OAuthProvider::from_config(c, http.clone())?),
                    ProviderConfig::Agent(c) => Arc::new(AgentProvider::from_config(c)?),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for provider in &providers {
            tracing::info!(
                provider = provider.name(),
                kind = provider.kind().as_str(),
                domain = provider.domain().unwrap_or(""),
                "identity provider configured"
            );
        }

        Self::new(providers)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn IdentityProvider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn IdentityProvider>> {
        self.providers.iter()
    }

    /// Providers eligible for a request: exact domain match when the caveat
    /// names a domain, otherwise the undomained ones.
    pub fn candidates<'a>(
        &'a self,
        domain: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Arc<dyn IdentityProvider>> + 'a {
        self.providers.iter().filter(move |p| p.domain() == domain)
    }

    /// For each kind in `kinds`, the first eligible provider supporting it.
    pub fn select(
        &self,
        domain: Option<&str>,
        kinds: &InteractionKinds,
    ) -> BTreeMap<InteractionKind, Arc<dyn IdentityProvider>> {
        let mut selected = BTreeMap::new();
        for kind in kinds {
            if let Some(provider) = self
                .candidates(domain)
                .find(|p| p.supported_interaction_kinds().contains(kind))
            {
                selected.insert(*kind, provider.clone());
            }
        }
        selected
    }

    pub fn first_agent(&self) -> Option<Arc<dyn IdentityProvider>> {
        self.providers
            .iter()
            .find(|p| p.kind() == ProviderKind::Agent)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentProviderConfig, StaticProviderConfig};

    fn static_provider(name: &str, domain: Option<&str>) -> Arc<dyn IdentityProvider> {
        Arc::new(StaticProvider::from_config(&StaticProviderConfig {
            name: name.to_string(),
            domain: domain.map(str::to_string),
            users: BTreeMap::new(),
        }))
    }

    fn agent(name: &str) -> Arc<dyn IdentityProvider> {
        Arc::new(
            AgentProvider::from_config(&AgentProviderConfig {
                name: name.to_string(),
                admin_public_key: None,
            })
            .unwrap(),
        )
    }

    #[test]
    fn duplicate_names_are_rejected() {
        assert!(ProviderRegistry::new(vec![agent("a"), agent("a")]).is_err());
    }

    #[test]
    fn selection_is_by_domain_then_config_order() {
        let registry = ProviderRegistry::new(vec![
            static_provider("test", None),
            static_provider("test2", Some("test2")),
            static_provider("test3", None),
            agent("agent"),
        ])
        .unwrap();

        let all: InteractionKinds = InteractionKind::ALL.into_iter().collect();

        let undomained = registry.select(None, &all);
        assert_eq!(undomained[&InteractionKind::BrowserRedirect].name(), "test");
        assert_eq!(undomained[&InteractionKind::LegacyForm].name(), "test");
        assert_eq!(undomained[&InteractionKind::SignedRequest].name(), "agent");

        let domained = registry.select(Some("test2"), &all);
        assert_eq!(domained.len(), 2);
        assert_eq!(domained[&InteractionKind::BrowserRedirect].name(), "test2");
        assert!(!domained.contains_key(&InteractionKind::SignedRequest));

        assert!(registry.select(Some("nowhere"), &all).is_empty());
    }
}
