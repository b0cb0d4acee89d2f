//! Discharge engine: identity store, providers, login sessions, minting
//! and the orchestrator tying them together.

pub mod bakery;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod providers;
pub mod sessions;
pub mod store;

pub use bakery::{Assertion, Bakery, Minter};
pub use error::DischargeError;
pub use orchestrator::{DischargeRequest, DischargeStart, Discharger};
pub use providers::{
    AgentProvider, Credentials, IdentityProvider, OAuthProvider, ProviderError, ProviderRegistry,
    SignedRequest, StaticProvider, VerifiedIdentity,
};
pub use sessions::{SessionError, SessionTracker};
pub use store::{IdentityStore, MemoryIdentityStore, PgIdentityStore, StoreError};
