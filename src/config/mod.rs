use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub tenancy: TenancyConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL. When unset the server runs on the in-memory engine.
    pub url: Option<String>,
    /// Upper bound on physical connections shared by every tenant
    pub max_connections: u32,
    /// Concurrent leases allowed per tenant pool
    pub tenant_pool_size: usize,
    pub acquire_timeout_ms: u64,
    pub operation_timeout_ms: Option<u64>,
    pub idle_pool_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenancyConfig {
    pub schema_prefix: String,
    /// Allows the "any tenant" last-resort resolution step. Never honored in production.
    pub allow_any_tenant_fallback: bool,
    pub tenant_agnostic_operations: Vec<String>,
    pub materialize_organization: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    pub fn idle_pool_ttl(&self) -> Option<Duration> {
        self.idle_pool_ttl_secs.map(Duration::from_secs)
    }

    /// Database URL with the password stripped, for logs
    pub fn redacted_url(&self) -> Option<String> {
        let raw = self.url.as_deref()?;
        match url::Url::parse(raw) {
            Ok(mut parsed) => {
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("****"));
                }
                Some(parsed.to_string())
            }
            Err(_) => Some("<unparseable database url>".to_string()),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    fn with_env_overrides(mut self) -> Self {
        // Database overrides
        if let Ok(v) = env::var("DATABASE_URL") {
            if !v.trim().is_empty() {
                self.database.url = Some(v);
            }
        }
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Ok(v) = env::var("DATABASE_TENANT_POOL_SIZE") {
            self.database.tenant_pool_size = v.parse().unwrap_or(self.database.tenant_pool_size);
        }
        if let Ok(v) = env::var("DATABASE_ACQUIRE_TIMEOUT_MS") {
            self.database.acquire_timeout_ms = v.parse().unwrap_or(self.database.acquire_timeout_ms);
        }
        if let Ok(v) = env::var("DATABASE_OPERATION_TIMEOUT_MS") {
            self.database.operation_timeout_ms = v.parse().ok();
        }
        if let Ok(v) = env::var("DATABASE_IDLE_POOL_TTL_SECS") {
            self.database.idle_pool_ttl_secs = v.parse().ok();
        }

        // Tenancy overrides
        if let Ok(v) = env::var("TENANCY_SCHEMA_PREFIX") {
            if !v.is_empty() && v.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                self.tenancy.schema_prefix = v;
            }
        }
        if let Ok(v) = env::var("TENANCY_ALLOW_ANY_TENANT_FALLBACK") {
            let requested = v.parse().unwrap_or(self.tenancy.allow_any_tenant_fallback);
            if requested && self.is_production() {
                tracing::warn!("TENANCY_ALLOW_ANY_TENANT_FALLBACK ignored in production");
            } else {
                self.tenancy.allow_any_tenant_fallback = requested;
            }
        }
        if let Ok(v) = env::var("TENANCY_AGNOSTIC_OPERATIONS") {
            self.tenancy.tenant_agnostic_operations = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("TENANCY_MATERIALIZE_ORGANIZATION") {
            self.tenancy.materialize_organization = v.parse().unwrap_or(self.tenancy.materialize_organization);
        }

        // Security overrides
        if let Ok(v) = env::var("JWT_SECRET") {
            self.security.jwt_secret = v;
        }
        if let Ok(v) = env::var("SECURITY_JWT_EXPIRY_HOURS") {
            self.security.jwt_expiry_hours = v.parse().unwrap_or(self.security.jwt_expiry_hours);
        }

        self
    }

    fn default_agnostic_operations() -> Vec<String> {
        ["bootstrap", "health", "login"].iter().map(|s| s.to_string()).collect()
    }

    pub fn development() -> Self {
        Self {
            environment: Environment::Development,
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
                tenant_pool_size: 4,
                acquire_timeout_ms: 5_000,
                operation_timeout_ms: None,
                idle_pool_ttl_secs: None,
            },
            tenancy: TenancyConfig {
                schema_prefix: "org_".to_string(),
                allow_any_tenant_fallback: true,
                tenant_agnostic_operations: Self::default_agnostic_operations(),
                materialize_organization: false,
            },
            security: SecurityConfig {
                jwt_secret: "development-secret".to_string(),
                jwt_expiry_hours: 24 * 7, // 1 week
            },
        }
    }

    pub fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            database: DatabaseConfig {
                url: None,
                max_connections: 20,
                tenant_pool_size: 8,
                acquire_timeout_ms: 3_000,
                operation_timeout_ms: Some(30_000),
                idle_pool_ttl_secs: Some(15 * 60),
            },
            tenancy: TenancyConfig {
                schema_prefix: "org_".to_string(),
                allow_any_tenant_fallback: false,
                tenant_agnostic_operations: Self::default_agnostic_operations(),
                materialize_organization: true,
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 24,
            },
        }
    }

    pub fn production() -> Self {
        Self {
            environment: Environment::Production,
            database: DatabaseConfig {
                url: None,
                max_connections: 50,
                tenant_pool_size: 10,
                acquire_timeout_ms: 2_000,
                operation_timeout_ms: Some(15_000),
                idle_pool_ttl_secs: Some(10 * 60),
            },
            tenancy: TenancyConfig {
                schema_prefix: "org_".to_string(),
                allow_any_tenant_fallback: false,
                tenant_agnostic_operations: Self::default_agnostic_operations(),
                materialize_organization: true,
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 4,
            },
        }
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

pub fn config() -> &'static AppConfig {
    &CONFIG
}
