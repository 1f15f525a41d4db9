//! Storage operations and the engines that execute them on a pinned
//! connection.

pub mod filter;
pub mod memory;
pub mod pipeline;
pub mod postgres;
pub mod routing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use filter::{Filter, FilterSpec, FindOptions, SortDirection, SortKey};
pub use memory::{MemoryConnection, MemoryDatabase, MemoryEngine};
pub use pipeline::PipelineSpec;
pub use postgres::PgStorageEngine;
pub use routing::{SchemaRoutingStorageAdapter, TenantSession};

/// A stored record: a JSON object with engine-assigned system fields.
pub type Record = Map<String, Value>;

/// Fields owned by the engine; stripped from client input.
pub const SYSTEM_FIELDS: [&str; 3] = ["id", "created_at", "updated_at"];

/// Failures reported by a storage engine. These are domain errors: the routing
/// adapter passes them through without reinterpretation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("No schema pinned on connection")]
    SchemaNotPinned,

    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

/// Per-entity constraints supplied by the business layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSpec {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub unique: Vec<String>,
}

impl SchemaSpec {
    pub fn required<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn unique<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Reject records missing a required field (absent or null)
    pub fn check_required(&self, record: &Record) -> Result<(), StorageError> {
        for field in &self.required {
            if record.get(field).map_or(true, Value::is_null) {
                return Err(StorageError::ConstraintViolation(format!(
                    "field '{}' is required",
                    field
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    pub deleted: u64,
}

/// Validate an entity kind for use as an unqualified table name.
pub fn validate_entity_kind(kind: &str) -> Result<(), StorageError> {
    let mut chars = kind.chars();
    let valid_start = chars.next().map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || kind.len() > 63 || !kind.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StorageError::InvalidFilter(format!("Invalid entity kind: {}", kind)));
    }
    Ok(())
}

/// Drop system fields from client-supplied input.
pub fn strip_system_fields(mut record: Record) -> Record {
    for field in SYSTEM_FIELDS {
        record.remove(field);
    }
    record
}

/// The generic engine below the routing adapter. Every call runs on a
/// connection that has already been pinned to the caller's schema; engines
/// never see a tenant id.
#[async_trait]
pub trait StorageEngine<C: Send>: Send + Sync + 'static {
    async fn find(
        &self,
        conn: &mut C,
        kind: &str,
        filter: &FilterSpec,
        options: &FindOptions,
    ) -> Result<Vec<Record>, StorageError>;

    async fn create(
        &self,
        conn: &mut C,
        kind: &str,
        schema: &SchemaSpec,
        record: Record,
    ) -> Result<Record, StorageError>;

    async fn update(
        &self,
        conn: &mut C,
        kind: &str,
        schema: &SchemaSpec,
        filter: &FilterSpec,
        patch: Record,
    ) -> Result<UpdateResult, StorageError>;

    async fn destroy(
        &self,
        conn: &mut C,
        kind: &str,
        schema: &SchemaSpec,
        filter: &FilterSpec,
    ) -> Result<DeleteResult, StorageError>;

    async fn count(
        &self,
        conn: &mut C,
        kind: &str,
        schema: &SchemaSpec,
        filter: &FilterSpec,
    ) -> Result<u64, StorageError>;

    async fn distinct(
        &self,
        conn: &mut C,
        kind: &str,
        schema: &SchemaSpec,
        field: &str,
    ) -> Result<Vec<Value>, StorageError>;

    async fn aggregate(
        &self,
        conn: &mut C,
        kind: &str,
        schema: &SchemaSpec,
        pipeline: &PipelineSpec,
    ) -> Result<Vec<Record>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validates_entity_kinds() {
        assert!(validate_entity_kind("Product").is_ok());
        assert!(validate_entity_kind("_audit_log").is_ok());
        assert!(validate_entity_kind("1abc").is_err());
        assert!(validate_entity_kind("Product\"; DROP").is_err());
        assert!(validate_entity_kind("").is_err());
    }

    #[test]
    fn required_fields_reject_missing_and_null() {
        let spec = SchemaSpec::default().required(["name"]);
        let ok = json!({"name": "widget"}).as_object().unwrap().clone();
        let null = json!({"name": null}).as_object().unwrap().clone();
        assert!(spec.check_required(&ok).is_ok());
        assert!(matches!(spec.check_required(&null), Err(StorageError::ConstraintViolation(_))));
        assert!(spec.check_required(&Record::new()).is_err());
    }
}
