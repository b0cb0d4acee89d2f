use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, FromRow};
use std::collections::{BTreeMap, BTreeSet};

use super::{IdentityStore, StoreError};
use crate::models::{Identity, IdentityUpdate, ProviderIdentity};

const UNIQUE_VIOLATION: &str = "23505";

const SELECT_COLUMNS: &str =
    "provider, subject, username, display_name, email, groups, extra_info, created_utc, updated_utc";

/// PostgreSQL-backed store. Every upsert is a single statement, so the
/// row lock serializes writers of one identity and per-field `COALESCE`
/// leaves unspecified columns alone.
#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct IdentityRow {
    provider: String,
    subject: String,
    username: String,
    display_name: String,
    email: String,
    groups: Vec<String>,
    extra_info: sqlx::types::Json<BTreeMap<String, String>>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<IdentityRow> for Identity {
    type Error = StoreError;

    fn try_from(row: IdentityRow) -> Result<Self, Self::Error> {
        // extra_info blobs are stored hex encoded inside JSONB.
        let extra_info = row
            .extra_info
            .0
            .into_iter()
            .map(|(k, v)| hex::decode(&v).map(|bytes| (k, bytes)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map_err(|e| StoreError::Internal(anyhow::anyhow!("corrupt extra_info: {}", e)))?;

        Ok(Identity {
            id: ProviderIdentity::new(row.provider, row.subject),
            username: row.username,
            display_name: row.display_name,
            email: row.email,
            groups: row.groups.into_iter().collect(),
            extra_info,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_write_error(err: sqlx::Error, username: Option<&str>) -> StoreError {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return StoreError::Conflict(username.unwrap_or_default().to_string());
            }
        }
        StoreError::Database(err)
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn find_by_provider_id(&self, id: &ProviderIdentity) -> Result<Identity, StoreError> {
        let sql = format!(
            "SELECT {} FROM identities WHERE provider = $1 AND subject = $2",
            SELECT_COLUMNS
        );
        let row: Option<IdentityRow> = sqlx::query_as(&sql)
            .bind(&id.provider)
            .bind(&id.subject)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| StoreError::NotFound(id.clone()))?.try_into()
    }

    async fn upsert_attributes(
        &self,
        id: &ProviderIdentity,
        update: IdentityUpdate,
    ) -> Result<Identity, StoreError> {
        let groups: Option<Vec<String>> = update.groups.map(|g| g.into_iter().collect());
        let extra_info: BTreeMap<String, String> = update
            .extra_info
            .iter()
            .map(|(k, v)| (k.clone(), hex::encode(v)))
            .collect();
        let extra_info = sqlx::types::Json(extra_info);

        // Without a username the row cannot be created, only updated.
        let sql = if update.username.is_some() {
            format!(
                r#"
                INSERT INTO identities (provider, subject, username, display_name, email, groups, extra_info)
                VALUES ($1, $2, $3, COALESCE($4, ''), COALESCE($5, ''), COALESCE($6, '{{}}'), $7)
                ON CONFLICT (provider, subject) DO UPDATE SET
                    username     = COALESCE($3, identities.username),
                    display_name = COALESCE($4, identities.display_name),
                    email        = COALESCE($5, identities.email),
                    groups       = COALESCE($6, identities.groups),
                    extra_info   = identities.extra_info || $7,
                    updated_utc  = now()
                RETURNING {}
                "#,
                SELECT_COLUMNS
            )
        } else {
            format!(
                r#"
                UPDATE identities SET
                    username     = COALESCE($3, username),
                    display_name = COALESCE($4, display_name),
                    email        = COALESCE($5, email),
                    groups       = COALESCE($6, groups),
                    extra_info   = extra_info || $7,
                    updated_utc  = now()
                WHERE provider = $1 AND subject = $2
                RETURNING {}
                "#,
                SELECT_COLUMNS
            )
        };

        let row: Option<IdentityRow> = sqlx::query_as(&sql)
            .bind(&id.provider)
            .bind(&id.subject)
            .bind(&update.username)
            .bind(&update.display_name)
            .bind(&update.email)
            .bind(&groups)
            .bind(&extra_info)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::map_write_error(e, update.username.as_deref()))?;

        row.ok_or_else(|| StoreError::NotFound(id.clone()))?.try_into()
    }

    async fn groups(&self, id: &ProviderIdentity) -> Result<BTreeSet<String>, StoreError> {
        let groups: Option<(Vec<String>,)> =
            sqlx::query_as("SELECT groups FROM identities WHERE provider = $1 AND subject = $2")
                .bind(&id.provider)
                .bind(&id.subject)
                .fetch_optional(&self.pool)
                .await?;

        groups
            .map(|(g,)| g.into_iter().collect())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        crate::db::health_check(&self.pool).await?;
        Ok(())
    }
}
