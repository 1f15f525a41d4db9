//! Tenant-routed storage.
//!
//! Every operation runs on a connection leased from the tenant's pool and
//! pinned to its schema. The engine below never sees a tenant id; it only
//! sees the pinned connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::filter::{FilterSpec, FindOptions};
use super::pipeline::PipelineSpec;
use super::{DeleteResult, Record, SchemaSpec, StorageEngine, StorageError, UpdateResult};
use crate::error::TenancyError;
use crate::pool::{ConnectionSource, PooledConnection, TenantConnectionPoolManager};
use crate::tenant::{ResolvedContext, TenantId};

/// Apply the optional per-operation time limit to an engine call.
async fn guarded<T, F>(
    operation: &'static str,
    tenant: &TenantId,
    limit: Option<Duration>,
    call: F,
) -> Result<T, TenancyError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    let Some(limit) = limit else {
        return call.await.map_err(TenancyError::from);
    };
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(TenancyError::from),
        Err(_) => {
            warn!(tenant = %tenant, operation, "Storage operation timed out after {:?}", limit);
            Err(TenancyError::OperationTimeout {
                operation,
                tenant: tenant.clone(),
                timeout: limit,
            })
        }
    }
}

/// Storage adapter that scopes every call to the tenant of a
/// [`ResolvedContext`].
pub struct SchemaRoutingStorageAdapter<S: ConnectionSource, E> {
    pools: Arc<TenantConnectionPoolManager<S>>,
    engine: Arc<E>,
    operation_timeout: Option<Duration>,
}

impl<S: ConnectionSource, E> Clone for SchemaRoutingStorageAdapter<S, E> {
    fn clone(&self) -> Self {
        Self {
            pools: Arc::clone(&self.pools),
            engine: Arc::clone(&self.engine),
            operation_timeout: self.operation_timeout,
        }
    }
}

impl<S, E> SchemaRoutingStorageAdapter<S, E>
where
    S: ConnectionSource,
    E: StorageEngine<S::Connection>,
{
    pub fn new(pools: Arc<TenantConnectionPoolManager<S>>, engine: Arc<E>) -> Self {
        Self {
            pools,
            engine,
            operation_timeout: None,
        }
    }

    /// Bound each engine call; a call that overruns fails with
    /// `OperationTimeout` and its connection is discarded.
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn pools(&self) -> &Arc<TenantConnectionPoolManager<S>> {
        &self.pools
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Lease one pinned connection for a sequence of operations. Operations on
    /// the session run in issue order on the same connection.
    pub async fn session(&self, ctx: &ResolvedContext) -> Result<TenantSession<S, E>, TenancyError> {
        let lease = self.pools.acquire(ctx.tenant_id()).await?;
        Ok(TenantSession {
            tenant: ctx.tenant_id().clone(),
            lease: Some(lease),
            engine: Arc::clone(&self.engine),
            operation_timeout: self.operation_timeout,
            operations: 0,
        })
    }

    pub async fn find(
        &self,
        ctx: &ResolvedContext,
        kind: &str,
        filter: &FilterSpec,
        options: &FindOptions,
    ) -> Result<Vec<Record>, TenancyError> {
        let mut session = self.session(ctx).await?;
        let found = session.find(kind, filter, options).await;
        session.finish();
        found
    }

    pub async fn create(
        &self,
        ctx: &ResolvedContext,
        kind: &str,
        schema: &SchemaSpec,
        record: Record,
    ) -> Result<Record, TenancyError> {
        let mut session = self.session(ctx).await?;
        let created = session.create(kind, schema, record).await;
        session.finish();
        created
    }

    pub async fn update(
        &self,
        ctx: &ResolvedContext,
        kind: &str,
        schema: &SchemaSpec,
        filter: &FilterSpec,
        patch: Record,
    ) -> Result<UpdateResult, TenancyError> {
        let mut session = self.session(ctx).await?;
        let updated = session.update(kind, schema, filter, patch).await;
        session.finish();
        updated
    }

    pub async fn destroy(
        &self,
        ctx: &ResolvedContext,
        kind: &str,
        schema: &SchemaSpec,
        filter: &FilterSpec,
    ) -> Result<DeleteResult, TenancyError> {
        let mut session = self.session(ctx).await?;
        let deleted = session.destroy(kind, schema, filter).await;
        session.finish();
        deleted
    }

    pub async fn count(
        &self,
        ctx: &ResolvedContext,
        kind: &str,
        schema: &SchemaSpec,
        filter: &FilterSpec,
    ) -> Result<u64, TenancyError> {
        let mut session = self.session(ctx).await?;
        let count = session.count(kind, schema, filter).await;
        session.finish();
        count
    }

    pub async fn distinct(
        &self,
        ctx: &ResolvedContext,
        kind: &str,
        schema: &SchemaSpec,
        field: &str,
    ) -> Result<Vec<Value>, TenancyError> {
        let mut session = self.session(ctx).await?;
        let values = session.distinct(kind, schema, field).await;
        session.finish();
        values
    }

    pub async fn aggregate(
        &self,
        ctx: &ResolvedContext,
        kind: &str,
        schema: &SchemaSpec,
        pipeline: &PipelineSpec,
    ) -> Result<Vec<Record>, TenancyError> {
        let mut session = self.session(ctx).await?;
        let rows = session.aggregate(kind, schema, pipeline).await;
        session.finish();
        rows
    }
}

/// A pinned connection held across several operations for one tenant.
///
/// Released when finished or dropped. If an operation times out the
/// connection is discarded and every later call on the session fails.
pub struct TenantSession<S: ConnectionSource, E> {
    tenant: TenantId,
    lease: Option<PooledConnection<S>>,
    engine: Arc<E>,
    operation_timeout: Option<Duration>,
    operations: u64,
}

impl<S, E> TenantSession<S, E>
where
    S: ConnectionSource,
    E: StorageEngine<S::Connection>,
{
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// The leased connection, if the session is still usable
    pub fn connection(&self) -> Option<&S::Connection> {
        self.lease.as_ref().map(|lease| lease.connection())
    }

    fn lease(&mut self) -> Result<&mut PooledConnection<S>, TenancyError> {
        self.lease.as_mut().ok_or_else(|| {
            TenancyError::Connection("session connection was discarded after a timeout".to_string())
        })
    }

    fn settle<T>(&mut self, outcome: &Result<T, TenancyError>) {
        self.operations += 1;
        match outcome {
            Err(TenancyError::OperationTimeout { .. }) => {
                if let Some(lease) = self.lease.take() {
                    lease.discard();
                }
            }
            _ => {
                if let Some(lease) = self.lease.as_mut() {
                    lease.end_use();
                }
            }
        }
    }

    pub async fn find(
        &mut self,
        kind: &str,
        filter: &FilterSpec,
        options: &FindOptions,
    ) -> Result<Vec<Record>, TenancyError> {
        let limit = self.operation_timeout;
        let engine = Arc::clone(&self.engine);
        let tenant = self.tenant.clone();
        let conn = self.lease()?.begin_use();
        let outcome = guarded("find", &tenant, limit, engine.find(conn, kind, filter, options)).await;
        self.settle(&outcome);
        outcome
    }

    pub async fn create(&mut self, kind: &str, schema: &SchemaSpec, record: Record) -> Result<Record, TenancyError> {
        let limit = self.operation_timeout;
        let engine = Arc::clone(&self.engine);
        let tenant = self.tenant.clone();
        let conn = self.lease()?.begin_use();
        let outcome = guarded("create", &tenant, limit, engine.create(conn, kind, schema, record)).await;
        self.settle(&outcome);
        outcome
    }

    pub async fn update(
        &mut self,
        kind: &str,
        schema: &SchemaSpec,
        filter: &FilterSpec,
        patch: Record,
    ) -> Result<UpdateResult, TenancyError> {
        let limit = self.operation_timeout;
        let engine = Arc::clone(&self.engine);
        let tenant = self.tenant.clone();
        let conn = self.lease()?.begin_use();
        let outcome = guarded("update", &tenant, limit, engine.update(conn, kind, schema, filter, patch)).await;
        self.settle(&outcome);
        outcome
    }

    pub async fn destroy(
        &mut self,
        kind: &str,
        schema: &SchemaSpec,
        filter: &FilterSpec,
    ) -> Result<DeleteResult, TenancyError> {
        let limit = self.operation_timeout;
        let engine = Arc::clone(&self.engine);
        let tenant = self.tenant.clone();
        let conn = self.lease()?.begin_use();
        let outcome = guarded("destroy", &tenant, limit, engine.destroy(conn, kind, schema, filter)).await;
        self.settle(&outcome);
        outcome
    }

    pub async fn count(&mut self, kind: &str, schema: &SchemaSpec, filter: &FilterSpec) -> Result<u64, TenancyError> {
        let limit = self.operation_timeout;
        let engine = Arc::clone(&self.engine);
        let tenant = self.tenant.clone();
        let conn = self.lease()?.begin_use();
        let outcome = guarded("count", &tenant, limit, engine.count(conn, kind, schema, filter)).await;
        self.settle(&outcome);
        outcome
    }

    pub async fn distinct(&mut self, kind: &str, schema: &SchemaSpec, field: &str) -> Result<Vec<Value>, TenancyError> {
        let limit = self.operation_timeout;
        let engine = Arc::clone(&self.engine);
        let tenant = self.tenant.clone();
        let conn = self.lease()?.begin_use();
        let outcome = guarded("distinct", &tenant, limit, engine.distinct(conn, kind, schema, field)).await;
        self.settle(&outcome);
        outcome
    }

    pub async fn aggregate(
        &mut self,
        kind: &str,
        schema: &SchemaSpec,
        pipeline: &PipelineSpec,
    ) -> Result<Vec<Record>, TenancyError> {
        let limit = self.operation_timeout;
        let engine = Arc::clone(&self.engine);
        let tenant = self.tenant.clone();
        let conn = self.lease()?.begin_use();
        let outcome = guarded("aggregate", &tenant, limit, engine.aggregate(conn, kind, schema, pipeline)).await;
        self.settle(&outcome);
        outcome
    }

    /// End the session, returning its connection to the pool.
    pub fn finish(mut self) {
        if let Some(lease) = self.lease.take() {
            debug!(tenant = %self.tenant, operations = self.operations, "Session finished");
            lease.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolSettings, SchemaConnection};
    use crate::storage::memory::{MemoryDatabase, MemoryEngine};
    use crate::tenant::{ResolutionMethod, SchemaName};
    use serde_json::json;

    type Adapter = SchemaRoutingStorageAdapter<MemoryDatabase, MemoryEngine>;

    fn context(tenant: &str) -> ResolvedContext {
        ResolvedContext::new(TenantId::parse(tenant).unwrap(), ResolutionMethod::Session, None)
    }

    fn stack(tenants: &[&str]) -> (Arc<MemoryDatabase>, Adapter) {
        let db = Arc::new(MemoryDatabase::new());
        for t in tenants {
            db.create_schema(&SchemaName::for_tenant("org_", &TenantId::parse(*t).unwrap()));
        }
        let settings = PoolSettings {
            acquire_timeout: Duration::from_millis(200),
            ..PoolSettings::default()
        };
        let pools = Arc::new(TenantConnectionPoolManager::new(Arc::clone(&db), settings));
        (db, SchemaRoutingStorageAdapter::new(pools, Arc::new(MemoryEngine)))
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn session_runs_operations_on_one_pinned_connection() {
        let (db, adapter) = stack(&["acme"]);
        let ctx = context("acme");
        let mut session = adapter.session(&ctx).await.unwrap();
        let schema = SchemaSpec::default();

        session.create("Note", &schema, record(json!({"text": "first"}))).await.unwrap();
        session.create("Note", &schema, record(json!({"text": "second"}))).await.unwrap();
        let notes = session.find("Note", &FilterSpec::all(), &FindOptions::default()).await.unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0]["text"], json!("first"));
        assert_eq!(session.connection().unwrap().pin_history().len(), 1);
        session.finish();

        assert_eq!(db.stats().pins, 1);
        assert_eq!(db.stats().recycled, 1);
    }

    #[tokio::test]
    async fn engine_errors_pass_through_and_release() {
        let (db, adapter) = stack(&["acme"]);
        let err = adapter
            .find(&context("acme"), "Note", &FilterSpec::new(json!({"a": {"$regex": "x"}})), &FindOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::Storage(StorageError::InvalidFilter(_))));

        let tenant = TenantId::parse("acme").unwrap();
        assert_eq!(adapter.pools().stats(&tenant).await.unwrap().leased, 0);
        assert_eq!(db.stats().recycled, 1);
    }

    #[tokio::test]
    async fn timed_out_operation_discards_its_connection() {
        let (db, adapter) = stack(&["acme"]);
        let adapter = adapter.with_operation_timeout(Some(Duration::from_millis(20)));
        db.set_latency(Duration::from_millis(200));

        let ctx = context("acme");
        let mut session = adapter.session(&ctx).await.unwrap();
        let err = session.count("Note", &SchemaSpec::default(), &FilterSpec::all()).await.unwrap_err();
        assert!(matches!(err, TenancyError::OperationTimeout { operation: "count", .. }));
        assert!(session.connection().is_none());

        let again = session.count("Note", &SchemaSpec::default(), &FilterSpec::all()).await;
        assert!(matches!(again, Err(TenancyError::Connection(_))));
        drop(session);

        let stats = db.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.recycled, 0);
        let tenant = TenantId::parse("acme").unwrap();
        assert_eq!(adapter.pools().stats(&tenant).await.unwrap().leased, 0);
    }

    #[tokio::test]
    async fn unknown_schema_never_reaches_the_engine() {
        let (db, adapter) = stack(&[]);
        let err = adapter
            .create(&context("ghost"), "Note", &SchemaSpec::default(), Record::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::SchemaPinFailed { .. }));
        assert_eq!(db.stats().pins, 0);
    }

    #[tokio::test]
    async fn pinned_schema_matches_context() {
        let (_db, adapter) = stack(&["acme", "globex"]);
        let session = adapter.session(&context("globex")).await.unwrap();
        assert_eq!(
            session.connection().and_then(|c| c.pinned_schema()).map(|s| s.as_str()),
            Some("org_globex")
        );
    }
}
