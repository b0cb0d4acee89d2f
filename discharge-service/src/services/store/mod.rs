//! Identity persistence.
//!
//! The orchestrator only sees [`IdentityStore`]; `main` chooses the
//! PostgreSQL implementation when a database is configured and the
//! in-memory one otherwise.

mod memory;
mod postgres;

pub use memory::MemoryIdentityStore;
pub use postgres::PgIdentityStore;

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::models::{Identity, IdentityUpdate, ProviderIdentity};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity {0} not found")]
    NotFound(ProviderIdentity),

    #[error("username {0:?} already in use")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_by_provider_id(&self, id: &ProviderIdentity) -> Result<Identity, StoreError>;

    /// Create the record if absent (the update must then carry a username),
    /// otherwise apply only the fields present in `update`.
    ///
    /// Concurrent calls for one id are serialized; calls for different ids
    /// do not wait on each other.
    async fn upsert_attributes(
        &self,
        id: &ProviderIdentity,
        update: IdentityUpdate,
    ) -> Result<Identity, StoreError>;

    /// Authoritative group set, reflecting the latest successful upsert.
    async fn groups(&self, id: &ProviderIdentity) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.find_by_provider_id(id).await?.groups)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
