// handlers/mod.rs - HTTP surface
//
// Every route sits behind the organization context layer. `/health` is
// tenant-agnostic; everything under /api/ runs against the admitted tenant.

pub mod data;

use axum::{
    extract::State,
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::middleware::{organization_context, ContextLayerState};
use crate::pool::ConnectionSource;
use crate::storage::{SchemaRoutingStorageAdapter, StorageEngine};

pub struct AppState<S: ConnectionSource, E> {
    pub adapter: SchemaRoutingStorageAdapter<S, E>,
}

impl<S: ConnectionSource, E> Clone for AppState<S, E> {
    fn clone(&self) -> Self {
        Self {
            adapter: self.adapter.clone(),
        }
    }
}

pub fn router<S, E>(adapter: SchemaRoutingStorageAdapter<S, E>, context: ContextLayerState) -> Router
where
    S: ConnectionSource,
    E: StorageEngine<S::Connection>,
{
    Router::new()
        .route("/health", get(health::<S, E>))
        .route("/api/context", get(data::context))
        .route("/api/find/:kind", post(data::find::<S, E>))
        .route("/api/create/:kind", post(data::create::<S, E>))
        .route("/api/update/:kind", post(data::update::<S, E>))
        .route("/api/destroy/:kind", post(data::destroy::<S, E>))
        .route("/api/count/:kind", post(data::count::<S, E>))
        .route("/api/distinct/:kind", post(data::distinct::<S, E>))
        .route("/api/aggregate/:kind", post(data::aggregate::<S, E>))
        .route_layer(from_fn_with_state(context, organization_context))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { adapter })
}

/// GET /health - physical connection source status
async fn health<S, E>(State(state): State<AppState<S, E>>) -> impl IntoResponse
where
    S: ConnectionSource,
    E: StorageEngine<S::Connection>,
{
    let now = chrono::Utc::now();
    let pools = state.adapter.pools().pool_count().await;

    match state.adapter.pools().source().ping().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": {
                    "status": "ok",
                    "timestamp": now,
                    "tenant_pools": pools
                }
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "success": false,
                "error": "database unavailable",
                "data": {
                    "status": "degraded",
                    "timestamp": now,
                    "database_error": e.to_string()
                }
            })),
        ),
    }
}
