use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};

use super::{IdentityStore, StoreError};
use crate::models::{Identity, IdentityUpdate, ProviderIdentity};

/// Process-local store. Records are sharded by id, so only upserts for the
/// same identity (or ids hashing to the same shard) contend.
///
/// Lock order: a `records` shard, then a `usernames` shard. Nothing takes
/// them the other way round.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    records: DashMap<ProviderIdentity, Identity>,
    usernames: DashMap<String, ProviderIdentity>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn claim_username(&self, username: &str, id: &ProviderIdentity) -> Result<(), StoreError> {
        match self.usernames.entry(username.to_string()) {
            Entry::Occupied(owner) if owner.get() != id => {
                Err(StoreError::Conflict(username.to_string()))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_by_provider_id(&self, id: &ProviderIdentity) -> Result<Identity, StoreError> {
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn upsert_attributes(
        &self,
        id: &ProviderIdentity,
        update: IdentityUpdate,
    ) -> Result<Identity, StoreError> {
        match self.records.entry(id.clone()) {
            Entry::Occupied(mut record) => {
                if let Some(username) = &update.username {
                    let previous = record.get().username.clone();
                    if *username != previous {
                        self.claim_username(username, id)?;
                        self.usernames.remove(&previous);
                    }
                }
                record.get_mut().apply(&update);
                Ok(record.get().clone())
            }
            Entry::Vacant(slot) => {
                let identity =
                    Identity::create(id.clone(), &update).ok_or_else(|| StoreError::NotFound(id.clone()))?;
                self.claim_username(&identity.username, id)?;
                slot.insert(identity.clone());
                Ok(identity)
            }
        }
    }
}
