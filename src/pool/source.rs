//! Physical connections shared by every tenant pool.

use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres};
use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::tenant::SchemaName;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no physical connection available")]
    Exhausted,

    #[error("connection source is closed")]
    Closed,

    #[error("{0}")]
    Failed(String),
}

/// A physical connection whose active schema can be switched.
#[async_trait]
pub trait SchemaConnection: Send + 'static {
    /// Make `schema` the only namespace unqualified names resolve against.
    async fn pin_schema(&mut self, schema: &SchemaName) -> anyhow::Result<()>;

    /// Schema pinned by the most recent successful `pin_schema`
    fn pinned_schema(&self) -> Option<&SchemaName>;
}

/// Supplies physical connections. Connections are not tenant-bound: the same
/// one is handed to different tenants over its lifetime.
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    type Connection: SchemaConnection;

    async fn checkout(&self) -> Result<Self::Connection, SourceError>;

    /// Hand a healthy connection back for reuse
    fn recycle(&self, conn: Self::Connection);

    /// Close a connection whose state can no longer be trusted
    fn discard(&self, conn: Self::Connection);

    async fn ping(&self) -> Result<(), SourceError>;

    async fn close(&self);
}

/// Postgres source: one shared sqlx pool of physical connections.
pub struct PgSource {
    pool: PgPool,
}

impl PgSource {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| sqlx::Error::Configuration("DATABASE_URL is not set".into()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(url)
            .await?;

        tracing::info!(
            "Connected physical pool to {} (max {} connections)",
            config.redacted_url().unwrap_or_default(),
            config.max_connections
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool, for collaborators that read shared (non-tenant) tables
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// A checked-out Postgres connection plus the schema it was last pinned to.
pub struct PgSchemaConnection {
    inner: PoolConnection<Postgres>,
    pinned: Option<SchemaName>,
}

impl Deref for PgSchemaConnection {
    type Target = PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PgSchemaConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[async_trait]
impl SchemaConnection for PgSchemaConnection {
    async fn pin_schema(&mut self, schema: &SchemaName) -> anyhow::Result<()> {
        // The previous lease may have pinned another tenant
        self.pinned = None;

        // search_path silently accepts missing schemas, so check first
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
                .bind(schema.as_str())
                .fetch_one(&mut *self.inner)
                .await?;
        if !exists {
            anyhow::bail!("schema {} does not exist", schema);
        }

        sqlx::query(&format!("SET search_path TO {}", schema.quoted()))
            .execute(&mut *self.inner)
            .await?;

        self.pinned = Some(schema.clone());
        Ok(())
    }

    fn pinned_schema(&self) -> Option<&SchemaName> {
        self.pinned.as_ref()
    }
}

#[async_trait]
impl ConnectionSource for PgSource {
    type Connection = PgSchemaConnection;

    async fn checkout(&self) -> Result<Self::Connection, SourceError> {
        match self.pool.acquire().await {
            Ok(inner) => Ok(PgSchemaConnection { inner, pinned: None }),
            Err(sqlx::Error::PoolTimedOut) => Err(SourceError::Exhausted),
            Err(sqlx::Error::PoolClosed) => Err(SourceError::Closed),
            Err(e) => Err(SourceError::Failed(e.to_string())),
        }
    }

    fn recycle(&self, conn: Self::Connection) {
        // Dropping a pool connection returns it to sqlx's idle set
        drop(conn);
    }

    fn discard(&self, conn: Self::Connection) {
        // Detached connections are closed instead of going back to the pool
        drop(conn.inner.detach());
    }

    async fn ping(&self) -> Result<(), SourceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| SourceError::Failed(e.to_string()))
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Closed physical connection pool");
    }
}
