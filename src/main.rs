use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use org_tenancy::config::{self, AppConfig};
use org_tenancy::handlers;
use org_tenancy::middleware::{ContextLayerState, OrganizationContextMiddleware};
use org_tenancy::pool::{ConnectionSource, PgSource, PoolSettings, TenantConnectionPoolManager};
use org_tenancy::storage::{MemoryDatabase, MemoryEngine, PgStorageEngine, SchemaRoutingStorageAdapter, StorageEngine};
use org_tenancy::tenant::{
    MemoryDirectory, Organization, OrganizationDirectory, PgDirectory, ResolverPolicy, SchemaName,
    TenantContextResolver, TenantId,
};

#[derive(Parser, Debug)]
#[command(name = "org-tenancy", version, about = "Schema-per-tenant data routing server")]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Seed an organization for the in-memory backend, e.g. `acme=alice,bob`
    #[arg(long = "seed", value_parser = parse_seed)]
    seeds: Vec<Organization>,
}

fn parse_seed(raw: &str) -> Result<Organization, String> {
    let (id, members) = raw.split_once('=').unwrap_or((raw, ""));
    let tenant = TenantId::parse(id).map_err(|e| e.to_string())?;
    let members = members.split(',').map(str::trim).filter(|m| !m.is_empty());
    Ok(Organization::new(tenant.as_str(), tenant.as_str()).with_members(members))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so DATABASE_URL and friends are picked up
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = config::config();
    info!("Starting org-tenancy in {:?} mode", config.environment);

    if config.database.url.is_some() {
        let source = PgSource::connect(&config.database).await?;
        let directory = Arc::new(PgDirectory::new(source.pool().clone()));
        serve(&args, config, Arc::new(source), PgStorageEngine, directory).await
    } else {
        warn!("DATABASE_URL not set; serving from the in-memory backend");
        let database = Arc::new(MemoryDatabase::new());
        let directory = Arc::new(MemoryDirectory::new());
        for organization in &args.seeds {
            let tenant = organization.tenant_id()?;
            database.create_schema(&SchemaName::for_tenant(&config.tenancy.schema_prefix, &tenant));
            directory.insert(organization.clone()).await;
            info!("Seeded organization {} ({} members)", tenant, organization.members.len());
        }
        serve(&args, config, database, MemoryEngine, directory).await
    }
}

async fn serve<S, E>(
    args: &Args,
    config: &AppConfig,
    source: Arc<S>,
    engine: E,
    directory: Arc<dyn OrganizationDirectory>,
) -> anyhow::Result<()>
where
    S: ConnectionSource,
    E: StorageEngine<S::Connection>,
{
    let pools = Arc::new(TenantConnectionPoolManager::new(source, PoolSettings::from_config(config)));
    let reaper = config
        .database
        .idle_pool_ttl()
        .map(|ttl| pools.spawn_idle_reaper(ttl));

    let adapter = SchemaRoutingStorageAdapter::new(Arc::clone(&pools), Arc::new(engine))
        .with_operation_timeout(config.database.operation_timeout());

    let resolver = Arc::new(TenantContextResolver::new(directory, ResolverPolicy::from_config(config)));
    let middleware = Arc::new(OrganizationContextMiddleware::from_config(resolver, config));
    let context = ContextLayerState::new(middleware, &config.security.jwt_secret);

    let app = handlers::router(adapter, context);

    let bind_addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    pools.close_all().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}
