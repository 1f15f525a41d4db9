//! Admission of units of work: decides, before any handler runs, which tenant
//! (if any) the work is scoped to.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::AppConfig;
use crate::error::TenancyError;
use crate::tenant::{Caller, ResolutionMethod, ResolvedContext, TenantContextResolver, TenantId, TenantScope};

/// Parameter naming the target tenant of a request
pub const TENANT_PARAM: &str = "organizationId";

/// One request or job as seen by the middleware.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    pub operation: String,
    pub caller: Option<Caller>,
    pub params: Map<String, Value>,
}

impl UnitOfWork {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_caller(mut self, caller: Caller) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Tenant named in the parameters, validated.
    pub fn asserted_tenant(&self) -> Result<Option<TenantId>, TenancyError> {
        match self.params.get(TENANT_PARAM) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(id)) => TenantId::parse(id.as_str()).map(Some),
            Some(other) => Err(TenancyError::InvalidTenantId(other.to_string())),
        }
    }
}

pub struct OrganizationContextMiddleware {
    resolver: Arc<TenantContextResolver>,
    tenant_agnostic: HashSet<String>,
}

impl OrganizationContextMiddleware {
    pub fn new<I, S>(resolver: Arc<TenantContextResolver>, tenant_agnostic: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resolver,
            tenant_agnostic: tenant_agnostic.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(resolver: Arc<TenantContextResolver>, config: &AppConfig) -> Self {
        Self::new(resolver, config.tenancy.tenant_agnostic_operations.iter().cloned())
    }

    pub fn resolver(&self) -> &Arc<TenantContextResolver> {
        &self.resolver
    }

    pub fn is_tenant_agnostic(&self, operation: &str) -> bool {
        self.tenant_agnostic.contains(operation)
    }

    /// Decide the scope of a unit of work. Nothing is executed here; a failure
    /// means the work must not run at all.
    pub async fn admit(&self, work: &UnitOfWork) -> Result<TenantScope, TenancyError> {
        if self.is_tenant_agnostic(&work.operation) {
            debug!(operation = %work.operation, "Tenant-agnostic operation, skipping resolution");
            return Ok(TenantScope::Unscoped);
        }

        let caller = work.caller.as_ref().ok_or_else(|| {
            TenancyError::Unauthenticated(format!("operation '{}' requires an authenticated caller", work.operation))
        })?;
        let asserted = work.asserted_tenant()?;

        if caller.privileged {
            // Privileged callers act on whichever tenant they name, or none
            return Ok(match asserted {
                Some(tenant) => {
                    debug!(operation = %work.operation, tenant = %tenant, "Privileged call scoped by parameter");
                    TenantScope::Scoped(ResolvedContext::new(tenant, ResolutionMethod::ExplicitParameter, None))
                }
                None => TenantScope::Unscoped,
            });
        }

        let ctx = self.resolver.resolve(caller, asserted.as_ref()).await?;
        Ok(TenantScope::Scoped(ctx))
    }

    /// Wrap a handler so it only ever runs after successful admission.
    pub fn wrap<H, Fut, T>(self: Arc<Self>, handler: H) -> impl Fn(UnitOfWork) -> BoxFuture<'static, Result<T, TenancyError>>
    where
        H: Fn(TenantScope, UnitOfWork) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TenancyError>> + Send + 'static,
        T: Send + 'static,
    {
        let handler = Arc::new(handler);
        move |work: UnitOfWork| {
            let middleware = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let scope = middleware.admit(&work).await?;
                handler(scope, work).await
            }) as BoxFuture<'static, Result<T, TenancyError>>
        }
    }
}
