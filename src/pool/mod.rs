//! Per-tenant connection pools.
//!
//! Every tenant gets a lazily created [`ConnectionPool`] that bounds how many
//! connections it may lease at once. Physical connections come from a shared
//! [`ConnectionSource`]; each lease pins the tenant's schema before the
//! connection is handed out and returns it (or discards it) exactly once.

pub mod source;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::TenancyError;
use crate::tenant::{SchemaName, TenantId};

pub use source::{ConnectionSource, PgSchemaConnection, PgSource, SchemaConnection, SourceError};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub schema_prefix: String,
    /// Concurrent leases per tenant
    pub max_size: usize,
    /// Bound on waiting for a lease and a physical connection
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            schema_prefix: "org_".to_string(),
            max_size: 4,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            schema_prefix: config.tenancy.schema_prefix.clone(),
            max_size: config.database.tenant_pool_size.max(1),
            acquire_timeout: config.database.acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    pub leased: usize,
    pub acquired_total: u64,
    pub discarded_total: u64,
}

/// Bounded set of leases scoped to one tenant's schema.
pub struct ConnectionPool<S: ConnectionSource> {
    tenant: TenantId,
    schema: SchemaName,
    source: Arc<S>,
    permits: Arc<Semaphore>,
    max_size: usize,
    acquire_timeout: Duration,
    acquired_total: AtomicU64,
    discarded_total: AtomicU64,
    last_used: Mutex<Instant>,
    /// Set once the pool leaves the registry; no new leases after that
    retired: AtomicBool,
}

impl<S: ConnectionSource> ConnectionPool<S> {
    fn new(tenant: TenantId, source: Arc<S>, settings: &PoolSettings) -> Self {
        let schema = SchemaName::for_tenant(&settings.schema_prefix, &tenant);
        Self {
            tenant,
            schema,
            source,
            permits: Arc::new(Semaphore::new(settings.max_size)),
            max_size: settings.max_size,
            acquire_timeout: settings.acquire_timeout,
            acquired_total: AtomicU64::new(0),
            discarded_total: AtomicU64::new(0),
            last_used: Mutex::new(Instant::now()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_size: self.max_size,
            leased: self.max_size - self.permits.available_permits(),
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
            discarded_total: self.discarded_total.load(Ordering::Relaxed),
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }
    }

    /// Lease a connection pinned to this pool's schema.
    ///
    /// The whole acquisition, pin included, is bounded by the pool's
    /// `acquire_timeout`. Fails with `PoolTimeout` when no lease or physical
    /// connection becomes available in time (nothing is leased in that case)
    /// and with `SchemaPinFailed` when pinning is rejected or does not finish
    /// in time (the connection is discarded). A retired pool refuses new
    /// leases with `Connection`.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<S>, TenancyError> {
        let started = Instant::now();
        let waited = tokio::time::timeout(self.acquire_timeout, async {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| SourceError::Closed)?;
            let conn = self.source.checkout().await?;
            Ok::<_, SourceError>((permit, conn))
        })
        .await;

        let (permit, conn) = match waited {
            Ok(Ok(lease)) => lease,
            Err(_) | Ok(Err(SourceError::Exhausted)) => {
                warn!(tenant = %self.tenant, "Timed out waiting for a connection");
                return Err(TenancyError::PoolTimeout {
                    tenant: self.tenant.clone(),
                    waited: self.acquire_timeout,
                });
            }
            Ok(Err(err)) => return Err(TenancyError::Connection(err.to_string())),
        };

        // Until the pin succeeds the connection is discarded on any exit,
        // including the caller dropping this future.
        let mut unpinned = Unpinned { pool: self, conn: Some(conn) };

        if self.is_retired() {
            unpinned.give_back();
            return Err(TenancyError::Connection(format!(
                "connection pool for tenant {} was retired",
                self.tenant
            )));
        }

        // Pinned on every lease; a recycled connection may still point at
        // whichever tenant used it last.
        let remaining = self.acquire_timeout.saturating_sub(started.elapsed());
        let pinned = match unpinned.conn.as_mut() {
            Some(conn) => tokio::time::timeout(remaining, conn.pin_schema(&self.schema))
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("pin did not finish within {:?}", self.acquire_timeout))),
            None => Err(anyhow::anyhow!("connection lost before pinning")),
        };
        if let Err(err) = pinned {
            warn!(tenant = %self.tenant, schema = %self.schema, "Schema pin failed, discarding connection: {}", err);
            drop(unpinned);
            return Err(TenancyError::SchemaPinFailed {
                tenant: self.tenant.clone(),
                reason: err.to_string(),
            });
        }

        self.acquired_total.fetch_add(1, Ordering::Relaxed);
        self.touch();
        debug!(tenant = %self.tenant, schema = %self.schema, "Leased pinned connection");

        Ok(PooledConnection {
            conn: unpinned.conn.take(),
            permit: Some(permit),
            pool: Arc::clone(self),
            in_flight: false,
            suspect: false,
        })
    }

    fn give_back(&self, conn: S::Connection, reusable: bool) {
        if reusable {
            self.source.recycle(conn);
            debug!(tenant = %self.tenant, "Released connection");
        } else {
            self.source.discard(conn);
            self.discarded_total.fetch_add(1, Ordering::Relaxed);
            warn!(tenant = %self.tenant, "Discarded connection in unknown state");
        }
        self.touch();
    }
}

/// A checked-out connection that has not been pinned yet. Dropped with the
/// connection still inside, it discards it.
struct Unpinned<'a, S: ConnectionSource> {
    pool: &'a ConnectionPool<S>,
    conn: Option<S::Connection>,
}

impl<S: ConnectionSource> Unpinned<'_, S> {
    /// Hand the connection back untouched; it was never pinned or used.
    fn give_back(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.source.recycle(conn);
        }
    }
}

impl<S: ConnectionSource> Drop for Unpinned<'_, S> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.source.discard(conn);
            self.pool.discarded_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A leased, schema-pinned connection.
///
/// The lease ends exactly once: through [`release`](Self::release),
/// [`discard`](Self::discard), or when dropped. A lease dropped while an
/// operation on it was still running (a cancelled or timed-out future) is
/// discarded rather than recycled.
pub struct PooledConnection<S: ConnectionSource> {
    conn: Option<S::Connection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<ConnectionPool<S>>,
    in_flight: bool,
    suspect: bool,
}

impl<S: ConnectionSource> PooledConnection<S> {
    pub fn tenant(&self) -> &TenantId {
        self.pool.tenant()
    }

    pub fn schema(&self) -> &SchemaName {
        self.pool.schema()
    }

    pub fn connection(&self) -> &S::Connection {
        self.conn.as_ref().expect("connection is held until the lease ends")
    }

    pub fn connection_mut(&mut self) -> &mut S::Connection {
        self.conn.as_mut().expect("connection is held until the lease ends")
    }

    /// Borrow the connection for an operation. Until [`end_use`](Self::end_use)
    /// is called the lease counts as busy and will be discarded if dropped.
    pub fn begin_use(&mut self) -> &mut S::Connection {
        self.in_flight = true;
        self.connection_mut()
    }

    pub fn end_use(&mut self) {
        self.in_flight = false;
    }

    /// Never hand this connection to another lease
    pub fn mark_suspect(&mut self) {
        self.suspect = true;
    }

    pub fn is_suspect(&self) -> bool {
        self.suspect || self.in_flight
    }

    pub fn release(self) {
        drop(self);
    }

    pub fn discard(mut self) {
        self.suspect = true;
        drop(self);
    }
}

impl<S: ConnectionSource> fmt::Debug for PooledConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("tenant", self.tenant())
            .field("schema", self.schema())
            .field("held", &self.conn.is_some())
            .field("in_flight", &self.in_flight)
            .field("suspect", &self.suspect)
            .finish()
    }
}

impl<S: ConnectionSource> Drop for PooledConnection<S> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let reusable = !self.is_suspect();
            self.pool.give_back(conn, reusable);
        }
        // Lease slot frees only after the connection is back with the source
        self.permit.take();
    }
}

/// Registry of tenant pools, shared process-wide.
pub struct TenantConnectionPoolManager<S: ConnectionSource> {
    source: Arc<S>,
    settings: PoolSettings,
    pools: RwLock<HashMap<TenantId, Arc<ConnectionPool<S>>>>,
}

impl<S: ConnectionSource> TenantConnectionPoolManager<S> {
    pub fn new(source: Arc<S>, settings: PoolSettings) -> Self {
        Self {
            source,
            settings,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Get the tenant's pool, creating it on first access. Pool construction
    /// performs no I/O, so the write lock is held only for the insert.
    pub async fn get_pool(&self, tenant: &TenantId) -> Arc<ConnectionPool<S>> {
        // Fast path: try read lock
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(tenant) {
                return Arc::clone(pool);
            }
        }

        let mut pools = self.pools.write().await;
        let pool = pools.entry(tenant.clone()).or_insert_with(|| {
            info!("Created connection pool for tenant: {}", tenant);
            Arc::new(ConnectionPool::new(tenant.clone(), Arc::clone(&self.source), &self.settings))
        });
        Arc::clone(pool)
    }

    /// Lease a pinned connection for `tenant`.
    ///
    /// Eviction may retire a pool between looking it up and leasing from it;
    /// the lease is then given up and taken again from the live pool, so a
    /// tenant never holds more than `max_size` leases across pools.
    pub async fn acquire(&self, tenant: &TenantId) -> Result<PooledConnection<S>, TenancyError> {
        loop {
            let pool = self.get_pool(tenant).await;
            let lease = match pool.acquire().await {
                Ok(lease) => lease,
                Err(_) if pool.is_retired() => continue,
                Err(err) => return Err(err),
            };

            // Holding a lease keeps the pool from being evicted from here on
            let live = {
                let pools = self.pools.read().await;
                pools.get(tenant).map_or(false, |current| Arc::ptr_eq(current, &pool))
            };
            if live {
                return Ok(lease);
            }
            debug!(tenant = %tenant, "Pool retired during acquire, retrying");
            lease.release();
        }
    }

    pub fn release(&self, conn: PooledConnection<S>) {
        conn.release();
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn stats(&self, tenant: &TenantId) -> Option<PoolStats> {
        self.pools.read().await.get(tenant).map(|p| p.stats())
    }

    /// Drop pools with no outstanding leases that have been idle longer than
    /// `max_idle`. Returns how many were removed.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut pools = self.pools.write().await;
        let before = pools.len();
        pools.retain(|tenant, pool| {
            let keep = pool.stats().leased > 0 || pool.idle_for() < max_idle;
            if !keep {
                pool.retire();
                info!("Evicted idle connection pool for tenant: {}", tenant);
            }
            keep
        });
        before - pools.len()
    }

    /// Periodically evict idle pools until the returned task is aborted.
    pub fn spawn_idle_reaper(self: &Arc<Self>, max_idle: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_idle.max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                manager.evict_idle(max_idle).await;
            }
        })
    }

    /// Close and remove all pools (e.g., on shutdown)
    pub async fn close_all(&self) {
        let mut pools = self.pools.write().await;
        for (tenant, pool) in pools.drain() {
            pool.retire();
            info!("Closed connection pool for tenant: {}", tenant);
        }
        self.source.close().await;
    }
}
