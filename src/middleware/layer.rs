//! axum integration of [`OrganizationContextMiddleware`].

use std::sync::Arc;

use axum::{
    extract::{MatchedPath, Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::Response,
};
use serde_json::{Map, Value};

use super::auth::caller_from_headers;
use super::organization::{OrganizationContextMiddleware, UnitOfWork, TENANT_PARAM};
use crate::error::{ApiError, TenancyError};
use crate::tenant::TenantId;

/// Header naming the target tenant; may accompany the query parameter only if they agree
pub const TENANT_HEADER: &str = "x-organization-id";

#[derive(Clone)]
pub struct ContextLayerState {
    pub middleware: Arc<OrganizationContextMiddleware>,
    pub jwt_secret: Arc<str>,
}

impl ContextLayerState {
    pub fn new(middleware: Arc<OrganizationContextMiddleware>, jwt_secret: &str) -> Self {
        Self {
            middleware,
            jwt_secret: Arc::from(jwt_secret),
        }
    }
}

/// Operation name for a route: its last literal path segment, or the
/// lowercased method for a route with none (`/api/find/:kind` is `find`).
pub fn operation_name(method: &Method, path: &str) -> String {
    path.split('/')
        .filter(|seg| !seg.is_empty() && !seg.starts_with(':') && !seg.starts_with('{'))
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| method.as_str().to_ascii_lowercase())
}

/// Tenant asserted by the header or the query string. Both may be given,
/// but only if they name the same tenant.
fn asserted_tenant(headers: &HeaderMap, query: Option<&str>) -> Result<Option<String>, TenancyError> {
    let from_header = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let from_query = query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(key, _)| key == TENANT_PARAM)
            .map(|(_, value)| value.into_owned())
    });

    match (from_header, from_query) {
        (Some(header), Some(query)) if header != query => Err(TenancyError::TenantMismatch {
            asserted: TenantId::parse(query)?,
            resolved: TenantId::parse(header)?,
        }),
        (header, query) => Ok(header.or(query)),
    }
}

/// Build the unit of work for a request. Tenant-agnostic operations ignore
/// bad credentials and tenant assertions, since they never resolve a tenant.
fn unit_of_work(
    state: &ContextLayerState,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<UnitOfWork, TenancyError> {
    let operation = operation_name(method, path);

    if state.middleware.is_tenant_agnostic(&operation) {
        let caller = caller_from_headers(headers, &state.jwt_secret).unwrap_or_else(|err| {
            tracing::debug!(operation = %operation, "Ignoring credentials on tenant-agnostic operation: {}", err);
            None
        });
        return Ok(UnitOfWork {
            operation,
            caller,
            params: Map::new(),
        });
    }

    let caller = caller_from_headers(headers, &state.jwt_secret)?;
    let mut params = Map::new();
    if let Some(tenant) = asserted_tenant(headers, query)? {
        params.insert(TENANT_PARAM.to_string(), Value::String(tenant));
    }
    Ok(UnitOfWork { operation, caller, params })
}

/// Admits the request through the organization middleware and injects the
/// resulting `TenantScope` (and the caller, when there is one). Rejected
/// requests never reach the handler.
pub async fn organization_context(
    State(state): State<ContextLayerState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let work = unit_of_work(
        &state,
        request.method(),
        &path,
        request.headers(),
        request.uri().query(),
    )?;
    let scope = state.middleware.admit(&work).await?;

    tracing::debug!(operation = %work.operation, scoped = scope.context().is_some(), "Admitted request");
    request.extensions_mut().insert(scope);
    if let Some(caller) = work.caller {
        request.extensions_mut().insert(caller);
    }

    Ok(next.run(request).await)
}
