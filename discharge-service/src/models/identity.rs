//! Identity records and field-scoped updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Stable key of an identity: the provider that vouches for it and that
/// provider's own subject identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderIdentity {
    pub provider: String,
    pub subject: String,
}

impl ProviderIdentity {
    pub fn new(provider: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            subject: subject.into(),
        }
    }
}

impl std::fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.subject)
    }
}

/// A user known to the discharger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: ProviderIdentity,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub groups: BTreeSet<String>,
    /// Provider-private state, e.g. cached federated tokens or agent keys.
    pub extra_info: BTreeMap<String, Vec<u8>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Identity {
    /// Build a new record from an update. Creation needs a username; every
    /// other field may be filled in later.
    pub fn create(id: ProviderIdentity, update: &IdentityUpdate) -> Option<Self> {
        let username = update.username.clone()?;
        let now = Utc::now();
        let mut identity = Self {
            id,
            username,
            display_name: String::new(),
            email: String::new(),
            groups: BTreeSet::new(),
            extra_info: BTreeMap::new(),
            created_utc: now,
            updated_utc: now,
        };
        identity.apply(update);
        Some(identity)
    }

    /// Apply only the fields present in `update`. The id never changes.
    pub fn apply(&mut self, update: &IdentityUpdate) {
        if let Some(username) = &update.username {
            self.username = username.clone();
        }
        if let Some(display_name) = &update.display_name {
            self.display_name = display_name.clone();
        }
        if let Some(email) = &update.email {
            self.email = email.clone();
        }
        if let Some(groups) = &update.groups {
            self.groups = groups.clone();
        }
        for (key, value) in &update.extra_info {
            self.extra_info.insert(key.clone(), value.clone());
        }
        self.updated_utc = Utc::now();
    }
}

/// A partial update. `None` means "leave unchanged"; clearing a field is an
/// explicit `Some` of the empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityUpdate {
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub groups: Option<BTreeSet<String>>,
    /// Keys to set; keys not mentioned are kept.
    pub extra_info: BTreeMap<String, Vec<u8>>,
}

impl IdentityUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    pub fn extra_info(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.extra_info.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.display_name.is_none()
            && self.email.is_none()
            && self.groups.is_none()
            && self.extra_info.is_empty()
    }

    /// Union of two updates where `later` wins on overlapping fields.
    /// Applying `self` then `later` equals applying the merged update.
    pub fn merge(mut self, later: IdentityUpdate) -> IdentityUpdate {
        if later.username.is_some() {
            self.username = later.username;
        }
        if later.display_name.is_some() {
            self.display_name = later.display_name;
        }
        if later.email.is_some() {
            self.email = later.email;
        }
        if later.groups.is_some() {
            self.groups = later.groups;
        }
        self.extra_info.extend(later.extra_info);
        self
    }
}
