//! Postgres storage engine.
//!
//! Each entity kind is a table in the tenant's schema, addressed by its
//! unqualified name so that the connection's search path decides which
//! tenant's rows are visible:
//!
//! ```sql
//! CREATE TABLE "Product" (
//!     id uuid PRIMARY KEY,
//!     data jsonb NOT NULL,
//!     created_at timestamptz NOT NULL,
//!     updated_at timestamptz NOT NULL
//! )
//! ```
//!
//! System fields are mirrored into `data` so a record reads back as one
//! object. Tables and unique indexes are created on first write.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::postgres::PgArguments;
use sqlx::query::QueryScalar;
use sqlx::{PgConnection, Postgres};
use tracing::debug;
use uuid::Uuid;

use super::filter::{json_path, total_cmp, Filter, FilterSpec, FindOptions};
use super::pipeline::{run_stages, PipelineSpec};
use super::{
    strip_system_fields, validate_entity_kind, DeleteResult, Record, SchemaSpec, StorageEngine, StorageError,
    UpdateResult,
};
use crate::pool::{PgSchemaConnection, SchemaConnection};

const UNDEFINED_TABLE: &str = "42P01";
const DUPLICATE_TABLE: &str = "42P07";
const UNIQUE_VIOLATION: &str = "23505";

fn has_code(err: &sqlx::Error, code: &str) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(code))
}

fn storage_error(err: sqlx::Error) -> StorageError {
    if has_code(&err, UNIQUE_VIOLATION) {
        let message = match &err {
            sqlx::Error::Database(db) => db.message().to_string(),
            other => other.to_string(),
        };
        return StorageError::ConstraintViolation(message);
    }
    StorageError::Backend(err)
}

fn into_record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn bind_all<'q>(
    mut query: QueryScalar<'q, Postgres, Value, PgArguments>,
    params: Vec<Value>,
) -> QueryScalar<'q, Postgres, Value, PgArguments> {
    for param in params {
        query = query.bind(param);
    }
    query
}

/// Storage engine over schema-pinned Postgres connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgStorageEngine;

impl PgStorageEngine {
    /// Quoted, unqualified table name for a validated kind.
    fn table(conn: &PgSchemaConnection, kind: &str) -> Result<String, StorageError> {
        conn.pinned_schema().ok_or(StorageError::SchemaNotPinned)?;
        validate_entity_kind(kind)?;
        Ok(format!("\"{}\"", kind))
    }

    async fn ensure_table(
        conn: &mut PgConnection,
        kind: &str,
        table: &str,
        schema: &SchemaSpec,
    ) -> Result<(), StorageError> {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id uuid PRIMARY KEY, \
                data jsonb NOT NULL, \
                created_at timestamptz NOT NULL, \
                updated_at timestamptz NOT NULL)",
            table
        );
        let mut statements = vec![create];
        for field in &schema.unique {
            statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS \"{}_{}_key\" ON {} (({}))",
                kind,
                field.replace('.', "_"),
                table,
                json_path(field)?
            ));
        }

        for statement in statements {
            match sqlx::query(&statement).execute(&mut *conn).await {
                Ok(_) => {}
                // Concurrent first writes race on the catalog
                Err(e) if has_code(&e, DUPLICATE_TABLE) || has_code(&e, UNIQUE_VIOLATION) => {
                    debug!("Ignoring concurrent DDL on {}: {}", table, e);
                }
                Err(e) => return Err(StorageError::Backend(e)),
            }
        }
        Ok(())
    }

    async fn select_data(
        conn: &mut PgConnection,
        table: &str,
        filter: &Filter,
        order: &str,
    ) -> Result<Vec<Record>, StorageError> {
        let (clause, params) = filter.to_sql(1)?;
        let sql = format!("SELECT data FROM {} WHERE {} {}", table, clause, order);
        match bind_all(sqlx::query_scalar(&sql), params).fetch_all(conn).await {
            Ok(rows) => Ok(rows.into_iter().map(into_record).collect()),
            Err(e) if has_code(&e, UNDEFINED_TABLE) => Ok(Vec::new()),
            Err(e) => Err(storage_error(e)),
        }
    }
}

#[async_trait]
impl StorageEngine<PgSchemaConnection> for PgStorageEngine {
    async fn find(
        &self,
        conn: &mut PgSchemaConnection,
        kind: &str,
        filter: &FilterSpec,
        options: &FindOptions,
    ) -> Result<Vec<Record>, StorageError> {
        let table = Self::table(conn, kind)?;
        let filter = filter.parse()?;
        let order = options.to_sql()?;
        Self::select_data(conn, &table, &filter, &order).await
    }

    async fn create(
        &self,
        conn: &mut PgSchemaConnection,
        kind: &str,
        schema: &SchemaSpec,
        record: Record,
    ) -> Result<Record, StorageError> {
        let table = Self::table(conn, kind)?;
        let mut record = strip_system_fields(record);
        schema.check_required(&record)?;
        Self::ensure_table(conn, kind, &table, schema).await?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        record.insert("id".to_string(), Value::String(id.to_string()));
        record.insert("created_at".to_string(), Value::String(now.to_rfc3339()));
        record.insert("updated_at".to_string(), Value::String(now.to_rfc3339()));

        let sql = format!(
            "INSERT INTO {} (id, data, created_at, updated_at) VALUES ($1, $2, $3, $3)",
            table
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(Value::Object(record.clone()))
            .bind(now)
            .execute(&mut **conn)
            .await
            .map_err(storage_error)?;
        Ok(record)
    }

    async fn update(
        &self,
        conn: &mut PgSchemaConnection,
        kind: &str,
        schema: &SchemaSpec,
        filter: &FilterSpec,
        patch: Record,
    ) -> Result<UpdateResult, StorageError> {
        let table = Self::table(conn, kind)?;
        let filter = filter.parse()?;
        let patch = strip_system_fields(patch);
        for field in &schema.required {
            if patch.get(field).map_or(false, Value::is_null) {
                return Err(StorageError::ConstraintViolation(format!("field '{}' is required", field)));
            }
        }

        let now = Utc::now();
        let (clause, params) = filter.to_sql(4)?;
        let sql = format!(
            "UPDATE {} SET data = data || $1::jsonb || jsonb_build_object('updated_at', $2::text), \
             updated_at = $3 WHERE {}",
            table, clause
        );
        let mut query = sqlx::query(&sql)
            .bind(Value::Object(patch))
            .bind(now.to_rfc3339())
            .bind(now);
        for param in params {
            query = query.bind(param);
        }
        match query.execute(&mut **conn).await {
            Ok(done) => Ok(UpdateResult {
                matched: done.rows_affected(),
                modified: done.rows_affected(),
            }),
            Err(e) if has_code(&e, UNDEFINED_TABLE) => Ok(UpdateResult::default()),
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn destroy(
        &self,
        conn: &mut PgSchemaConnection,
        kind: &str,
        _schema: &SchemaSpec,
        filter: &FilterSpec,
    ) -> Result<DeleteResult, StorageError> {
        let table = Self::table(conn, kind)?;
        let (clause, params) = filter.parse()?.to_sql(1)?;
        let sql = format!("DELETE FROM {} WHERE {}", table, clause);
        let mut query = sqlx::query(&sql);
        for param in params {
            query = query.bind(param);
        }
        match query.execute(&mut **conn).await {
            Ok(done) => Ok(DeleteResult { deleted: done.rows_affected() }),
            Err(e) if has_code(&e, UNDEFINED_TABLE) => Ok(DeleteResult::default()),
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn count(
        &self,
        conn: &mut PgSchemaConnection,
        kind: &str,
        _schema: &SchemaSpec,
        filter: &FilterSpec,
    ) -> Result<u64, StorageError> {
        let table = Self::table(conn, kind)?;
        let (clause, params) = filter.parse()?.to_sql(1)?;
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, clause);
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for param in params {
            query = query.bind(param);
        }
        match query.fetch_one(&mut **conn).await {
            Ok(n) => Ok(n.max(0) as u64),
            Err(e) if has_code(&e, UNDEFINED_TABLE) => Ok(0),
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn distinct(
        &self,
        conn: &mut PgSchemaConnection,
        kind: &str,
        _schema: &SchemaSpec,
        field: &str,
    ) -> Result<Vec<Value>, StorageError> {
        let table = Self::table(conn, kind)?;
        let column = json_path(field)?;
        let sql = format!(
            "SELECT DISTINCT {c} FROM {t} WHERE {c} IS NOT NULL AND {c} <> 'null'::jsonb",
            c = column,
            t = table
        );
        match sqlx::query_scalar::<_, Value>(&sql).fetch_all(&mut **conn).await {
            Ok(mut values) => {
                values.sort_by(|a, b| total_cmp(Some(a), Some(b)));
                Ok(values)
            }
            Err(e) if has_code(&e, UNDEFINED_TABLE) => Ok(Vec::new()),
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn aggregate(
        &self,
        conn: &mut PgSchemaConnection,
        kind: &str,
        _schema: &SchemaSpec,
        pipeline: &PipelineSpec,
    ) -> Result<Vec<Record>, StorageError> {
        let table = Self::table(conn, kind)?;
        // A leading $match runs in SQL; remaining stages run in process
        let (leading, rest) = pipeline.split_leading_match();
        let everything = Filter::default();
        let records = Self::select_data(
            conn,
            &table,
            leading.unwrap_or(&everything),
            "ORDER BY created_at, id",
        )
        .await?;
        Ok(run_stages(rest, records))
    }
}
