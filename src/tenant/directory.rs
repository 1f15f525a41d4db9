//! Read access to organizations, used by the resolver's lookup steps.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;

use super::Organization;
use crate::error::TenancyError;

#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    /// Fetch one organization. `Ok(None)` when it does not exist.
    async fn fetch(&self, id: &str) -> Result<Option<Organization>, TenancyError>;

    /// Every organization whose membership contains `user_id`, ordered by id.
    async fn find_by_member(&self, user_id: &str) -> Result<Vec<Organization>, TenancyError>;

    /// The organization with the lowest id, if any exist.
    async fn any(&self) -> Result<Option<Organization>, TenancyError>;
}

/// Directory backed by an ordered map, for tests and the in-memory server.
#[derive(Default)]
pub struct MemoryDirectory {
    organizations: RwLock<BTreeMap<String, Organization>>,
    lookups: AtomicUsize,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, organization: Organization) {
        self.organizations
            .write()
            .await
            .insert(organization.id.clone(), organization);
    }

    pub async fn remove(&self, id: &str) -> Option<Organization> {
        self.organizations.write().await.remove(id)
    }

    /// Number of lookups served so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl OrganizationDirectory for MemoryDirectory {
    async fn fetch(&self, id: &str) -> Result<Option<Organization>, TenancyError> {
        self.record_lookup();
        Ok(self.organizations.read().await.get(id).cloned())
    }

    async fn find_by_member(&self, user_id: &str) -> Result<Vec<Organization>, TenancyError> {
        self.record_lookup();
        Ok(self
            .organizations
            .read()
            .await
            .values()
            .filter(|org| org.has_member(user_id))
            .cloned()
            .collect())
    }

    async fn any(&self) -> Result<Option<Organization>, TenancyError> {
        self.record_lookup();
        Ok(self.organizations.read().await.values().next().cloned())
    }
}

/// Directory reading the shared `public.organizations` table.
///
/// Expected shape: `id text primary key, name text, members text[],
/// created_at timestamptz`.
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn organization_from_row(row: &sqlx::postgres::PgRow) -> Result<Organization, sqlx::Error> {
        Ok(Organization {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            members: row.try_get::<Option<Vec<String>>, _>("members")?.unwrap_or_default(),
            created_at: row.try_get::<Option<DateTime<Utc>>, _>("created_at")?,
        })
    }

    fn lookup_failed(err: sqlx::Error) -> TenancyError {
        tracing::error!("Organization lookup failed: {}", err);
        TenancyError::Directory(err.to_string())
    }
}

#[async_trait]
impl OrganizationDirectory for PgDirectory {
    async fn fetch(&self, id: &str) -> Result<Option<Organization>, TenancyError> {
        let row = sqlx::query(
            "SELECT id, name, members, created_at FROM public.organizations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::lookup_failed)?;

        row.map(|r| Self::organization_from_row(&r))
            .transpose()
            .map_err(Self::lookup_failed)
    }

    async fn find_by_member(&self, user_id: &str) -> Result<Vec<Organization>, TenancyError> {
        let rows = sqlx::query(
            "SELECT id, name, members, created_at FROM public.organizations \
             WHERE $1 = ANY(members) ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::lookup_failed)?;

        rows.iter()
            .map(Self::organization_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Self::lookup_failed)
    }

    async fn any(&self) -> Result<Option<Organization>, TenancyError> {
        let row = sqlx::query(
            "SELECT id, name, members, created_at FROM public.organizations ORDER BY id LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::lookup_failed)?;

        row.map(|r| Self::organization_from_row(&r))
            .transpose()
            .map_err(Self::lookup_failed)
    }
}
