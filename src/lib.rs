pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod pool;
pub mod storage;
pub mod tenant;

pub use error::{ApiError, TenancyError};
pub use middleware::{OrganizationContextMiddleware, UnitOfWork};
pub use pool::{ConnectionPool, PooledConnection, TenantConnectionPoolManager};
pub use storage::{SchemaRoutingStorageAdapter, StorageEngine, StorageError, TenantSession};
pub use tenant::{ResolvedContext, TenantContextResolver, TenantId, TenantScope};
