//! Discharge orchestration.
//!
//! Received -> ProviderSelected -> AwaitingAuthentication ->
//! Discharged | Denied | Errored. A session entry carries the request
//! across the interaction round trip; identity attributes are persisted
//! and read back before anything is minted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use super::bakery::{Assertion, Minter};
use super::error::DischargeError;
use super::metrics::{
    record_discharge_outcome, record_login_attempt, OUTCOME_DENIED, OUTCOME_DISCHARGED,
    OUTCOME_ERRORED, OUTCOME_INTERACTION_REQUIRED, OUTCOME_METHOD_NOT_SUPPORTED,
};
use super::providers::{
    AuthContext, Credentials, IdentityProvider, ProviderError, ProviderRegistry, VerifiedIdentity,
};
use super::sessions::{CaveatContext, SessionTracker};
use super::store::IdentityStore;
use crate::dtos::InteractionInfo;
use crate::models::{
    Condition, DischargeFailure, InteractionKind, InteractionKinds, Macaroon, Protocol, WaitId,
    WaitState,
};

#[derive(Debug, Clone)]
pub struct DischargeRequest {
    pub caveat_id: Vec<u8>,
    /// Kinds the client says it can drive; `None` means it did not say.
    pub client_kinds: Option<InteractionKinds>,
}

#[derive(Debug)]
pub enum DischargeStart {
    /// The caveat's session already succeeded; this is its discharge.
    Discharged(Macaroon),
    InteractionRequired(InteractionInfo),
}

/// Kinds the discharger is willing to offer for each protocol.
pub fn protocol_kinds(protocol: Protocol) -> InteractionKinds {
    match protocol {
        Protocol::Legacy => [
            InteractionKind::BrowserRedirect,
            InteractionKind::LegacyForm,
            InteractionKind::SignedRequest,
        ]
        .into_iter()
        .collect(),
        Protocol::Modern => [InteractionKind::BrowserRedirect, InteractionKind::SignedRequest]
            .into_iter()
            .collect(),
    }
}

/// The part of `available` a requester declared it can drive; everything
/// when it declared nothing.
fn offer_for(
    available: &BTreeMap<InteractionKind, String>,
    client_kinds: Option<&InteractionKinds>,
) -> BTreeMap<InteractionKind, String> {
    available
        .iter()
        .filter(|(kind, _)| client_kinds.map_or(true, |client| client.contains(*kind)))
        .map(|(kind, provider)| (*kind, provider.clone()))
        .collect()
}

pub struct Discharger {
    location: String,
    registry: ProviderRegistry,
    store: Arc<dyn IdentityStore>,
    sessions: Arc<SessionTracker>,
    minter: Arc<dyn Minter>,
    wait_timeout: Duration,
}

impl Discharger {
    pub fn new(
        location: impl Into<String>,
        registry: ProviderRegistry,
        store: Arc<dyn IdentityStore>,
        sessions: Arc<SessionTracker>,
        minter: Arc<dyn Minter>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            location: location.into().trim_end_matches('/').to_string(),
            registry,
            store,
            sessions,
            minter,
            wait_timeout,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// Handle a discharge request up to the point where the client has to
    /// interact.
    pub fn start(&self, request: DischargeRequest) -> Result<DischargeStart, DischargeError> {
        // Received
        let decoded = self.minter.decode_caveat(&request.caveat_id)?;
        let condition = decoded.condition;
        let domain = condition.condition.domain().map(str::to_string);

        // ProviderSelected
        let wanted = protocol_kinds(condition.protocol());
        let available = self.registry.select(domain.as_deref(), &wanted);
        if available.is_empty() {
            record_discharge_outcome(OUTCOME_ERRORED);
            return Err(DischargeError::NoUsableProvider(match &domain {
                Some(domain) => format!("no identity provider serves domain {:?}", domain),
                None => format!("no identity provider supports {}", condition.condition.name()),
            }));
        }

        let available: BTreeMap<InteractionKind, String> = available
            .into_iter()
            .map(|(kind, provider)| (kind, provider.name().to_string()))
            .collect();
        let offered = offer_for(&available, request.client_kinds.as_ref());
        if offered.is_empty() {
            // No session is opened and no provider is consulted.
            record_discharge_outcome(OUTCOME_METHOD_NOT_SUPPORTED);
            return Err(DischargeError::MethodNotSupported(
                "none of the client's interaction methods are available".to_string(),
            ));
        }

        let handle = self.sessions.create(CaveatContext {
            caveat_id: decoded.caveat_id,
            condition,
            available,
        });

        match handle.state {
            WaitState::Succeeded(macaroon) => {
                tracing::debug!(wait_id = %handle.wait_id, "caveat already discharged");
                Ok(DischargeStart::Discharged(macaroon))
            }
            _ => {
                // AwaitingAuthentication. A reused session was opened by a
                // requester that may have declared other kinds.
                let offered = offer_for(&handle.context.available, request.client_kinds.as_ref());
                tracing::info!(
                    wait_id = %handle.wait_id,
                    protocol = handle.context.protocol().as_str(),
                    reused = handle.reused,
                    "interaction required"
                );
                record_discharge_outcome(OUTCOME_INTERACTION_REQUIRED);
                Ok(DischargeStart::InteractionRequired(self.interaction_info(
                    &handle.wait_id,
                    handle.context.protocol(),
                    &offered,
                )))
            }
        }
    }

    fn interaction_info(
        &self,
        wait_id: &WaitId,
        protocol: Protocol,
        offered: &BTreeMap<InteractionKind, String>,
    ) -> InteractionInfo {
        let methods: BTreeMap<String, String> = offered
            .iter()
            .map(|(kind, provider)| (kind.to_string(), self.visit_url(provider, *kind, wait_id)))
            .collect();

        let visit_url = offered
            .get(&InteractionKind::BrowserRedirect)
            .map(|provider| self.visit_url(provider, InteractionKind::BrowserRedirect, wait_id))
            .or_else(|| methods.values().next().cloned())
            .unwrap_or_default();

        let wait_path = match protocol {
            Protocol::Legacy => "wait",
            Protocol::Modern => "wait-token",
        };

        InteractionInfo {
            wait_id: wait_id.to_string(),
            wait_url: format!("{}/{}?waitid={}", self.location, wait_path, wait_id),
            visit_url,
            interaction_methods: methods,
        }
    }

    pub fn visit_url(&self, provider: &str, kind: InteractionKind, wait_id: &WaitId) -> String {
        format!(
            "{}/login/{}/{}?waitid={}",
            self.location,
            urlencoding::encode(provider),
            kind.endpoint(),
            wait_id
        )
    }

    /// Per-provider entry points for headless discovery.
    pub fn login_methods(&self) -> BTreeMap<String, String> {
        let mut methods = BTreeMap::new();
        for provider in self.registry.iter() {
            let kinds = provider.supported_interaction_kinds();
            let entry = if kinds.contains(&InteractionKind::BrowserRedirect) {
                InteractionKind::BrowserRedirect
            } else {
                InteractionKind::SignedRequest
            };
            methods.insert(
                provider.name().to_string(),
                format!("{}/login/{}/{}", self.location, provider.name(), entry.endpoint()),
            );
        }
        if self.registry.first_agent().is_some() {
            methods.insert("agent".to_string(), format!("{}/login/legacy-agent", self.location));
        }
        methods
    }

    /// Run one login attempt for a pending session.
    pub async fn authenticate(
        &self,
        wait_id: &WaitId,
        provider_name: &str,
        kind: InteractionKind,
        credentials: Credentials,
    ) -> Result<Macaroon, DischargeError> {
        let context = self.sessions.context(wait_id)?;
        match self.sessions.state(wait_id)? {
            WaitState::Succeeded(macaroon) => return Ok(macaroon),
            WaitState::Failed(failure) => {
                return Err(DischargeError::BadRequest(format!(
                    "login already failed ({}); start a new discharge",
                    failure.code
                )))
            }
            WaitState::Pending => {}
        }

        let provider = self.provider_for(&context, provider_name, kind)?;
        let ctx = AuthContext {
            wait_id,
            store: self.store.as_ref(),
        };

        let verified = match provider.authenticate(&ctx, kind, credentials).await {
            Ok(verified) => verified,
            Err(ProviderError::AuthenticationFailed(reason)) => {
                // Denied
                record_login_attempt(provider_name, OUTCOME_DENIED);
                let err = DischargeError::AuthenticationFailed(reason);
                self.fail(wait_id, &err);
                return Err(err);
            }
            Err(e @ (ProviderError::UnsupportedInteraction(_) | ProviderError::ProviderUnavailable(_))) => {
                // The client may try another kind or retry later.
                tracing::warn!(wait_id = %wait_id, provider = provider_name, error = %e, "login attempt not completed");
                record_login_attempt(provider_name, OUTCOME_ERRORED);
                return Err(e.into());
            }
            Err(e) => {
                record_login_attempt(provider_name, OUTCOME_ERRORED);
                let err: DischargeError = e.into();
                self.fail(wait_id, &err);
                return Err(err);
            }
        };
        record_login_attempt(provider_name, "accepted");

        match self.complete(&context, verified).await {
            Ok(macaroon) => self.settle(wait_id, macaroon),
            Err(err) => {
                self.fail(wait_id, &err);
                Err(err)
            }
        }
    }

    fn provider_for(
        &self,
        context: &CaveatContext,
        provider_name: &str,
        kind: InteractionKind,
    ) -> Result<Arc<dyn IdentityProvider>, DischargeError> {
        let provider = self.registry.get(provider_name).ok_or_else(|| {
            DischargeError::NotFound(format!("identity provider {:?} not found", provider_name))
        })?;
        if provider.domain() != context.condition.condition.domain() {
            return Err(DischargeError::BadRequest(format!(
                "identity provider {:?} cannot serve this login",
                provider_name
            )));
        }
        let Some(selected) = context.available.get(&kind) else {
            return Err(DischargeError::UnsupportedInteraction(kind.to_string()));
        };
        // The legacy agent endpoint always logs in through the first agent.
        let legacy_agent = kind == InteractionKind::SignedRequest
            && self
                .registry
                .first_agent()
                .is_some_and(|agent| agent.name() == provider_name);
        if selected.as_str() != provider_name && !legacy_agent {
            return Err(DischargeError::BadRequest(format!(
                "identity provider {:?} was not offered for {}",
                provider_name, kind
            )));
        }
        Ok(provider)
    }

    /// Persist, read back, check membership, then mint.
    async fn complete(
        &self,
        context: &CaveatContext,
        verified: VerifiedIdentity,
    ) -> Result<Macaroon, DischargeError> {
        let (username, groups) = if verified.admin {
            (verified.username.clone(), None)
        } else {
            let identity = self
                .store
                .upsert_attributes(&verified.id, verified.attribute_update())
                .await?;
            let groups = self.store.groups(&verified.id).await?;
            (identity.username, Some(groups))
        };

        let assertion = match &context.condition.condition {
            Condition::IsAuthenticatedUser { .. } => Assertion {
                username,
                groups: None,
            },
            Condition::IsMemberOf { groups: required } => {
                let matched = match &groups {
                    // The administrative identity is a member of everything.
                    None => required.clone(),
                    Some(held) => required.iter().filter(|g| held.contains(*g)).cloned().collect(),
                };
                if matched.is_empty() {
                    return Err(DischargeError::AuthenticationFailed(format!(
                        "user {:?} is not a member of a required group",
                        username
                    )));
                }
                Assertion {
                    username,
                    groups: Some(dedup(matched)),
                }
            }
        };

        Ok(self.minter.mint(&context.caveat_id, &assertion)?)
    }

    fn settle(&self, wait_id: &WaitId, macaroon: Macaroon) -> Result<Macaroon, DischargeError> {
        if self.sessions.resolve(wait_id, WaitState::Succeeded(macaroon.clone()))? {
            tracing::info!(wait_id = %wait_id, username = macaroon.declared("username").unwrap_or(""), "discharged");
            record_discharge_outcome(OUTCOME_DISCHARGED);
            return Ok(macaroon);
        }
        // Lost a race with another login for the same session; hand out the
        // discharge that won so the caveat has exactly one.
        match self.sessions.state(wait_id)? {
            WaitState::Succeeded(existing) => Ok(existing),
            WaitState::Failed(failure) => Err(failure_error(failure)),
            WaitState::Pending => Err(DischargeError::Internal(anyhow::anyhow!(
                "session {} still pending after resolve",
                wait_id
            ))),
        }
    }

    fn fail(&self, wait_id: &WaitId, err: &DischargeError) {
        let outcome = match err {
            DischargeError::AuthenticationFailed(_) => OUTCOME_DENIED,
            _ => OUTCOME_ERRORED,
        };
        tracing::info!(wait_id = %wait_id, outcome, code = err.code(), "login failed");
        record_discharge_outcome(outcome);

        let failure = WaitState::Failed(DischargeFailure {
            code: err.code().to_string(),
            message: err.public_message(),
        });
        if let Err(e) = self.sessions.resolve(wait_id, failure) {
            tracing::debug!(wait_id = %wait_id, error = %e, "session gone before failure was recorded");
        }
    }

    /// Wait for the session's result, bounded by the configured timeout.
    pub async fn wait(&self, wait_id: &WaitId) -> Result<Macaroon, DischargeError> {
        match self.sessions.wait(wait_id, self.wait_timeout).await? {
            WaitState::Succeeded(macaroon) => Ok(macaroon),
            WaitState::Failed(failure) => Err(failure_error(failure)),
            WaitState::Pending => Err(DischargeError::Timeout),
        }
    }
}

fn dedup(groups: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    groups.into_iter().filter(|g| seen.insert(g.clone())).collect()
}

/// Rebuild the error a stored failure was recorded from.
pub fn failure_error(failure: DischargeFailure) -> DischargeError {
    let DischargeFailure { code, message } = failure;
    match code.as_str() {
        "authentication failed" => DischargeError::AuthenticationFailed(message),
        "not found" => DischargeError::NotFound(message),
        "already exists" => DischargeError::Conflict(message),
        "bad request" => DischargeError::BadRequest(message),
        _ => DischargeError::Internal(anyhow::anyhow!(message)),
    }
}
