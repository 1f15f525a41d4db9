//! Tenant-scoped storage operations over HTTP. Every handler runs behind the
//! organization context layer and reads its tenant from the admitted
//! `TenantScope`, never from the request body.

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::Value;

use super::AppState;
use crate::error::ApiError;
use crate::middleware::{ApiResponse, ApiResult, TENANT_PARAM};
use crate::pool::ConnectionSource;
use crate::storage::{
    DeleteResult, FilterSpec, FindOptions, PipelineSpec, Record, SchemaSpec, StorageEngine, UpdateResult,
};
use crate::tenant::{ResolvedContext, TenantScope};

fn scoped(scope: &TenantScope) -> Result<&ResolvedContext, ApiError> {
    scope
        .context()
        .ok_or_else(|| ApiError::bad_request(format!("{} is required for this operation", TENANT_PARAM)))
}

#[derive(Debug, Default, Deserialize)]
pub struct FindBody {
    #[serde(default)]
    pub filter: FilterSpec,
    /// e.g. `"price desc, name"`
    pub order: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub record: Record,
    #[serde(default)]
    pub schema: SchemaSpec,
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    #[serde(default)]
    pub filter: FilterSpec,
    pub patch: Record,
    #[serde(default)]
    pub schema: SchemaSpec,
}

#[derive(Debug, Default, Deserialize)]
pub struct FilterBody {
    #[serde(default)]
    pub filter: FilterSpec,
    #[serde(default)]
    pub schema: SchemaSpec,
}

#[derive(Debug, Deserialize)]
pub struct DistinctBody {
    pub field: String,
    #[serde(default)]
    pub schema: SchemaSpec,
}

#[derive(Debug, Deserialize)]
pub struct AggregateBody {
    pub pipeline: PipelineSpec,
    #[serde(default)]
    pub schema: SchemaSpec,
}

/// GET /api/context - the tenant this request was admitted for
pub async fn context(Extension(scope): Extension<TenantScope>) -> ApiResult<ResolvedContext> {
    Ok(ApiResponse::success(scoped(&scope)?.clone()))
}

/// POST /api/find/:kind
pub async fn find<S, E>(
    State(state): State<AppState<S, E>>,
    Extension(scope): Extension<TenantScope>,
    Path(kind): Path<String>,
    Json(body): Json<FindBody>,
) -> ApiResult<Vec<Record>>
where
    S: ConnectionSource,
    E: StorageEngine<S::Connection>,
{
    let ctx = scoped(&scope)?;
    let mut options = FindOptions {
        limit: body.limit,
        offset: body.offset,
        ..Default::default()
    };
    if let Some(order) = body.order.as_deref() {
        options.order = FindOptions::parse_order(order)?;
    }
    let records = state.adapter.find(ctx, &kind, &body.filter, &options).await?;
    Ok(ApiResponse::success(records))
}

/// POST /api/create/:kind
pub async fn create<S, E>(
    State(state): State<AppState<S, E>>,
    Extension(scope): Extension<TenantScope>,
    Path(kind): Path<String>,
    Json(body): Json<CreateBody>,
) -> ApiResult<Record>
where
    S: ConnectionSource,
    E: StorageEngine<S::Connection>,
{
    let ctx = scoped(&scope)?;
    let record = state.adapter.create(ctx, &kind, &body.schema, body.record).await?;
    Ok(ApiResponse::created(record))
}

/// POST /api/update/:kind
pub async fn update<S, E>(
    State(state): State<AppState<S, E>>,
    Extension(scope): Extension<TenantScope>,
    Path(kind): Path<String>,
    Json(body): Json<UpdateBody>,
) -> ApiResult<UpdateResult>
where
    S: ConnectionSource,
    E: StorageEngine<S::Connection>,
{
    let ctx = scoped(&scope)?;
    let result = state
        .adapter
        .update(ctx, &kind, &body.schema, &body.filter, body.patch)
        .await?;
    Ok(ApiResponse::success(result))
}

/// POST /api/destroy/:kind
pub async fn destroy<S, E>(
    State(state): State<AppState<S, E>>,
    Extension(scope): Extension<TenantScope>,
    Path(kind): Path<String>,
    Json(body): Json<FilterBody>,
) -> ApiResult<DeleteResult>
where
    S: ConnectionSource,
    E: StorageEngine<S::Connection>,
{
    let ctx = scoped(&scope)?;
    let result = state.adapter.destroy(ctx, &kind, &body.schema, &body.filter).await?;
    Ok(ApiResponse::success(result))
}

/// POST /api/count/:kind
pub async fn count<S, E>(
    State(state): State<AppState<S, E>>,
    Extension(scope): Extension<TenantScope>,
    Path(kind): Path<String>,
    Json(body): Json<FilterBody>,
) -> ApiResult<u64>
where
    S: ConnectionSource,
    E: StorageEngine<S::Connection>,
{
    let ctx = scoped(&scope)?;
    let count = state.adapter.count(ctx, &kind, &body.schema, &body.filter).await?;
    Ok(ApiResponse::success(count))
}

/// POST /api/distinct/:kind
pub async fn distinct<S, E>(
    State(state): State<AppState<S, E>>,
    Extension(scope): Extension<TenantScope>,
    Path(kind): Path<String>,
    Json(body): Json<DistinctBody>,
) -> ApiResult<Vec<Value>>
where
    S: ConnectionSource,
    E: StorageEngine<S::Connection>,
{
    let ctx = scoped(&scope)?;
    let values = state.adapter.distinct(ctx, &kind, &body.schema, &body.field).await?;
    Ok(ApiResponse::success(values))
}

/// POST /api/aggregate/:kind
pub async fn aggregate<S, E>(
    State(state): State<AppState<S, E>>,
    Extension(scope): Extension<TenantScope>,
    Path(kind): Path<String>,
    Json(body): Json<AggregateBody>,
) -> ApiResult<Vec<Record>>
where
    S: ConnectionSource,
    E: StorageEngine<S::Connection>,
{
    let ctx = scoped(&scope)?;
    let rows = state.adapter.aggregate(ctx, &kind, &body.schema, &body.pipeline).await?;
    Ok(ApiResponse::success(rows))
}
