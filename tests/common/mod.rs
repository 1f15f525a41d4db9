#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use org_tenancy::handlers;
use org_tenancy::middleware::{issue_token, Claims, ContextLayerState, OrganizationContextMiddleware};
use org_tenancy::pool::{PoolSettings, TenantConnectionPoolManager};
use org_tenancy::storage::{MemoryDatabase, MemoryEngine, Record, SchemaRoutingStorageAdapter};
use org_tenancy::tenant::{
    Caller, MemoryDirectory, Organization, ResolvedContext, ResolverPolicy, SchemaName, TenantContextResolver,
    TenantId,
};

pub const JWT_SECRET: &str = "integration-test-secret";

pub type Adapter = SchemaRoutingStorageAdapter<MemoryDatabase, MemoryEngine>;

/// Knobs for the in-memory stack
#[derive(Debug, Clone)]
pub struct StackOptions {
    pub max_connections: Option<usize>,
    pub tenant_pool_size: usize,
    pub acquire_timeout: Duration,
    pub operation_timeout: Option<Duration>,
    pub allow_any_tenant_fallback: bool,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            max_connections: None,
            tenant_pool_size: 4,
            acquire_timeout: Duration::from_millis(500),
            operation_timeout: None,
            allow_any_tenant_fallback: false,
        }
    }
}

/// A complete in-memory deployment: directory, database, pools, adapter and
/// middleware, wired the way the server wires them.
pub struct Stack {
    pub database: Arc<MemoryDatabase>,
    pub directory: Arc<MemoryDirectory>,
    pub pools: Arc<TenantConnectionPoolManager<MemoryDatabase>>,
    pub adapter: Adapter,
    pub resolver: Arc<TenantContextResolver>,
    pub middleware: Arc<OrganizationContextMiddleware>,
}

impl Stack {
    /// Organizations as `(id, members)`; each gets a provisioned schema.
    pub async fn new(organizations: &[(&str, &[&str])]) -> Self {
        Self::with_options(organizations, StackOptions::default()).await
    }

    pub async fn with_options(organizations: &[(&str, &[&str])], options: StackOptions) -> Self {
        let mut database = MemoryDatabase::new();
        if let Some(max) = options.max_connections {
            database = database.with_max_connections(max);
        }
        let database = Arc::new(database);
        let directory = Arc::new(MemoryDirectory::new());

        for (id, members) in organizations {
            let org = Organization::new(*id, id.to_uppercase()).with_members(members.iter().copied());
            database.create_schema(&schema(id));
            directory.insert(org).await;
        }

        let settings = PoolSettings {
            schema_prefix: "org_".to_string(),
            max_size: options.tenant_pool_size,
            acquire_timeout: options.acquire_timeout,
        };
        let pools = Arc::new(TenantConnectionPoolManager::new(Arc::clone(&database), settings));
        let adapter = SchemaRoutingStorageAdapter::new(Arc::clone(&pools), Arc::new(MemoryEngine))
            .with_operation_timeout(options.operation_timeout);

        let policy = ResolverPolicy {
            allow_any_tenant_fallback: options.allow_any_tenant_fallback,
            materialize_organization: false,
        };
        let resolver = Arc::new(TenantContextResolver::new(directory.clone(), policy));
        let middleware = Arc::new(OrganizationContextMiddleware::new(
            Arc::clone(&resolver),
            ["bootstrap", "health", "login"],
        ));

        Self {
            database,
            directory,
            pools,
            adapter,
            resolver,
            middleware,
        }
    }

    /// Resolve a plain member's context through the real resolver
    pub async fn context_for(&self, user: &str) -> ResolvedContext {
        self.resolver
            .resolve(&Caller::user(user), None)
            .await
            .unwrap_or_else(|e| panic!("failed to resolve {}: {}", user, e))
    }

    pub fn router(&self) -> axum::Router {
        let context = ContextLayerState::new(Arc::clone(&self.middleware), JWT_SECRET);
        handlers::router(self.adapter.clone(), context)
    }
}

pub fn tenant(id: &str) -> TenantId {
    TenantId::parse(id).expect("valid tenant id")
}

pub fn schema(id: &str) -> SchemaName {
    SchemaName::for_tenant("org_", &tenant(id))
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("record literal must be an object")
}

pub fn token_for(user: &str) -> String {
    issue_token(&Claims::new(user, 1), JWT_SECRET).expect("token")
}

pub fn master_token() -> String {
    issue_token(&Claims::new("root", 1).master(), JWT_SECRET).expect("token")
}

/// In-process server on an ephemeral port
pub struct TestServer {
    pub base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn(app: axum::Router) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind test listener")?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self { base_url, handle })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
