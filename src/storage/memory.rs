//! In-process backend: a [`ConnectionSource`] of simulated physical
//! connections over schema-partitioned record tables, plus the
//! [`StorageEngine`] that runs on them.
//!
//! Connections behave like Postgres sessions: a recycled connection keeps the
//! search path of whichever tenant used it last, and unqualified table names
//! resolve only against that path.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::filter::{lookup, total_cmp, validate_field_path, FilterSpec, FindOptions};
use super::pipeline::PipelineSpec;
use super::{
    strip_system_fields, validate_entity_kind, DeleteResult, Record, SchemaSpec, StorageEngine, StorageError,
    UpdateResult,
};
use crate::pool::{ConnectionSource, SchemaConnection, SourceError};
use crate::tenant::SchemaName;

#[derive(Debug, Default)]
struct Data {
    schemas: HashMap<String, HashMap<String, Vec<Record>>>,
    rejected_pins: HashSet<String>,
    latency: Duration,
    pin_latency: Duration,
    pins: u64,
}

fn lock(data: &Mutex<Data>) -> MutexGuard<'_, Data> {
    // A panicking test thread must not wedge every other connection
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Physical connections ever opened
    pub opened: u64,
    pub recycled: u64,
    pub discarded: u64,
    /// Connections currently waiting for reuse
    pub idle: usize,
    /// Successful schema pins
    pub pins: u64,
}

#[derive(Debug, Default)]
struct Counters {
    opened: u64,
    recycled: u64,
    discarded: u64,
    next_id: u64,
    closed: bool,
}

/// Shared in-memory database.
pub struct MemoryDatabase {
    data: Arc<Mutex<Data>>,
    idle: Mutex<Vec<MemoryConnection>>,
    counters: Mutex<Counters>,
    max_connections: Option<usize>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(Data::default())),
            idle: Mutex::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
            max_connections: None,
        }
    }

    /// Cap the number of live physical connections across all tenants.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn create_schema(&self, schema: &SchemaName) {
        lock(&self.data).schemas.entry(schema.as_str().to_string()).or_default();
    }

    pub fn drop_schema(&self, schema: &SchemaName) {
        lock(&self.data).schemas.remove(schema.as_str());
    }

    /// Make every future pin to `schema` fail.
    pub fn reject_pins(&self, schema: &SchemaName) {
        lock(&self.data).rejected_pins.insert(schema.as_str().to_string());
    }

    /// Delay applied to every storage operation.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.data).latency = latency;
    }

    /// Delay applied to every schema pin, before it takes effect.
    pub fn set_pin_latency(&self, latency: Duration) {
        lock(&self.data).pin_latency = latency;
    }

    /// Snapshot of a table, bypassing connections entirely.
    pub fn records(&self, schema: &SchemaName, kind: &str) -> Vec<Record> {
        lock(&self.data)
            .schemas
            .get(schema.as_str())
            .and_then(|tables| tables.get(kind))
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> MemoryStats {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        MemoryStats {
            opened: counters.opened,
            recycled: counters.recycled,
            discarded: counters.discarded,
            idle: self.idle.lock().map(|idle| idle.len()).unwrap_or(0),
            pins: lock(&self.data).pins,
        }
    }

    fn idle_pop(&self) -> Option<MemoryConnection> {
        self.idle.lock().ok()?.pop()
    }
}

#[async_trait]
impl ConnectionSource for MemoryDatabase {
    type Connection = MemoryConnection;

    async fn checkout(&self) -> Result<Self::Connection, SourceError> {
        // Most recently returned first, so reuse across tenants is predictable
        if let Some(conn) = self.idle_pop() {
            return Ok(conn);
        }

        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        if counters.closed {
            return Err(SourceError::Closed);
        }
        let live = counters.opened - counters.discarded;
        if self.max_connections.map_or(false, |max| live as usize >= max) {
            return Err(SourceError::Exhausted);
        }
        counters.opened += 1;
        counters.next_id += 1;
        Ok(MemoryConnection {
            id: counters.next_id,
            search_path: None,
            pin_history: Vec::new(),
            data: Arc::clone(&self.data),
        })
    }

    fn recycle(&self, conn: Self::Connection) {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        if counters.closed {
            counters.discarded += 1;
            return;
        }
        counters.recycled += 1;
        drop(counters);
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }

    fn discard(&self, conn: Self::Connection) {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        counters.discarded += 1;
        drop(conn);
    }

    async fn ping(&self) -> Result<(), SourceError> {
        if self.counters.lock().map(|c| c.closed).unwrap_or(true) {
            return Err(SourceError::Closed);
        }
        Ok(())
    }

    async fn close(&self) {
        let drained = self.idle.lock().map(|mut idle| idle.drain(..).count()).unwrap_or(0);
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        counters.closed = true;
        counters.discarded += drained as u64;
    }
}

/// A simulated physical connection.
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    search_path: Option<SchemaName>,
    pin_history: Vec<SchemaName>,
    data: Arc<Mutex<Data>>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Every schema this physical connection has been pinned to, in order.
    pub fn pin_history(&self) -> &[SchemaName] {
        &self.pin_history
    }

    async fn simulate_latency(&self) {
        let latency = lock(&self.data).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Run `f` against a table in the pinned schema. Tables spring into
    /// existence on first write.
    fn with_table<T>(
        &self,
        kind: &str,
        create: bool,
        f: impl FnOnce(&mut Vec<Record>) -> Result<T, StorageError>,
    ) -> Result<Option<T>, StorageError> {
        validate_entity_kind(kind)?;
        let schema = self.search_path.as_ref().ok_or(StorageError::SchemaNotPinned)?;
        let mut data = lock(&self.data);
        let tables = data
            .schemas
            .get_mut(schema.as_str())
            .ok_or_else(|| StorageError::NotFound(format!("schema {}", schema)))?;
        if create {
            return f(tables.entry(kind.to_string()).or_default()).map(Some);
        }
        match tables.get_mut(kind) {
            Some(table) => f(table).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SchemaConnection for MemoryConnection {
    async fn pin_schema(&mut self, schema: &SchemaName) -> anyhow::Result<()> {
        self.search_path = None;
        let latency = lock(&self.data).pin_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        {
            let mut data = lock(&self.data);
            if data.rejected_pins.contains(schema.as_str()) {
                anyhow::bail!("pin to {} rejected", schema);
            }
            if !data.schemas.contains_key(schema.as_str()) {
                anyhow::bail!("schema {} does not exist", schema);
            }
            data.pins += 1;
        }
        self.search_path = Some(schema.clone());
        self.pin_history.push(schema.clone());
        Ok(())
    }

    fn pinned_schema(&self) -> Option<&SchemaName> {
        self.search_path.as_ref()
    }
}

fn check_unique(
    schema: &SchemaSpec,
    table: &[Record],
    candidate: &Record,
    skip: Option<usize>,
) -> Result<(), StorageError> {
    for field in &schema.unique {
        let Some(value) = candidate.get(field).filter(|v| !v.is_null()) else {
            continue;
        };
        let taken = table
            .iter()
            .enumerate()
            .any(|(i, r)| Some(i) != skip && r.get(field) == Some(value));
        if taken {
            return Err(StorageError::ConstraintViolation(format!(
                "duplicate value for unique field '{}'",
                field
            )));
        }
    }
    Ok(())
}

/// Rows rewritten by one update must not collide with each other either.
fn check_unique_among<'a>(
    schema: &SchemaSpec,
    rows: impl Iterator<Item = &'a Record> + Clone,
) -> Result<(), StorageError> {
    for field in &schema.unique {
        let mut seen = HashSet::new();
        for value in rows.clone().filter_map(|r| r.get(field)).filter(|v| !v.is_null()) {
            if !seen.insert(value.to_string()) {
                return Err(StorageError::ConstraintViolation(format!(
                    "duplicate value for unique field '{}'",
                    field
                )));
            }
        }
    }
    Ok(())
}

/// Storage engine over [`MemoryConnection`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryEngine;

#[async_trait]
impl StorageEngine<MemoryConnection> for MemoryEngine {
    async fn find(
        &self,
        conn: &mut MemoryConnection,
        kind: &str,
        filter: &FilterSpec,
        options: &FindOptions,
    ) -> Result<Vec<Record>, StorageError> {
        let filter = filter.parse()?;
        conn.simulate_latency().await;
        let found = conn.with_table(kind, false, |table| {
            Ok(table.iter().filter(|r| filter.matches(r)).cloned().collect::<Vec<_>>())
        })?;
        Ok(options.apply(found.unwrap_or_default()))
    }

    async fn create(
        &self,
        conn: &mut MemoryConnection,
        kind: &str,
        schema: &SchemaSpec,
        record: Record,
    ) -> Result<Record, StorageError> {
        let mut record = strip_system_fields(record);
        schema.check_required(&record)?;
        conn.simulate_latency().await;

        let now = Value::String(Utc::now().to_rfc3339());
        record.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
        record.insert("created_at".to_string(), now.clone());
        record.insert("updated_at".to_string(), now);

        let created = conn.with_table(kind, true, |table| {
            check_unique(schema, table, &record, None)?;
            table.push(record.clone());
            Ok(record)
        })?;
        created.ok_or_else(|| StorageError::NotFound(kind.to_string()))
    }

    async fn update(
        &self,
        conn: &mut MemoryConnection,
        kind: &str,
        schema: &SchemaSpec,
        filter: &FilterSpec,
        patch: Record,
    ) -> Result<UpdateResult, StorageError> {
        let filter = filter.parse()?;
        let patch = strip_system_fields(patch);
        conn.simulate_latency().await;

        let result = conn.with_table(kind, false, |table| {
            let now = Value::String(Utc::now().to_rfc3339());
            let mut staged = Vec::new();
            for (i, record) in table.iter().enumerate().filter(|(_, r)| filter.matches(r)) {
                let mut next = record.clone();
                for (k, v) in &patch {
                    next.insert(k.clone(), v.clone());
                }
                staged.push((i, next != *record, next));
            }

            // Validate every change before applying any of them
            for (i, changed, next) in &staged {
                if *changed {
                    schema.check_required(next)?;
                    check_unique(schema, table, next, Some(*i))?;
                }
            }
            check_unique_among(schema, staged.iter().filter(|(_, changed, _)| *changed).map(|(_, _, next)| next))?;
            for (_, changed, next) in &mut staged {
                if *changed {
                    next.insert("updated_at".to_string(), now.clone());
                }
            }

            let matched = staged.len() as u64;
            let mut modified = 0;
            for (i, changed, next) in staged {
                if changed {
                    table[i] = next;
                    modified += 1;
                }
            }
            Ok(UpdateResult { matched, modified })
        })?;
        Ok(result.unwrap_or_default())
    }

    async fn destroy(
        &self,
        conn: &mut MemoryConnection,
        kind: &str,
        _schema: &SchemaSpec,
        filter: &FilterSpec,
    ) -> Result<DeleteResult, StorageError> {
        let filter = filter.parse()?;
        conn.simulate_latency().await;
        let deleted = conn.with_table(kind, false, |table| {
            let before = table.len();
            table.retain(|r| !filter.matches(r));
            Ok((before - table.len()) as u64)
        })?;
        Ok(DeleteResult { deleted: deleted.unwrap_or(0) })
    }

    async fn count(
        &self,
        conn: &mut MemoryConnection,
        kind: &str,
        _schema: &SchemaSpec,
        filter: &FilterSpec,
    ) -> Result<u64, StorageError> {
        let filter = filter.parse()?;
        conn.simulate_latency().await;
        let count = conn.with_table(kind, false, |table| {
            Ok(table.iter().filter(|r| filter.matches(r)).count() as u64)
        })?;
        Ok(count.unwrap_or(0))
    }

    async fn distinct(
        &self,
        conn: &mut MemoryConnection,
        kind: &str,
        _schema: &SchemaSpec,
        field: &str,
    ) -> Result<Vec<Value>, StorageError> {
        validate_field_path(field)?;
        conn.simulate_latency().await;
        let values = conn.with_table(kind, false, |table| {
            let mut values: Vec<Value> = table
                .iter()
                .filter_map(|r| lookup(r, field))
                .filter(|v| !v.is_null())
                .cloned()
                .collect();
            values.sort_by(|a, b| total_cmp(Some(a), Some(b)));
            values.dedup();
            Ok(values)
        })?;
        Ok(values.unwrap_or_default())
    }

    async fn aggregate(
        &self,
        conn: &mut MemoryConnection,
        kind: &str,
        _schema: &SchemaSpec,
        pipeline: &PipelineSpec,
    ) -> Result<Vec<Record>, StorageError> {
        conn.simulate_latency().await;
        let records = conn.with_table(kind, false, |table| Ok(table.clone()))?;
        Ok(pipeline.run(records.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantId;
    use serde_json::json;

    fn schema(tenant: &str) -> SchemaName {
        SchemaName::for_tenant("org_", &TenantId::parse(tenant).unwrap())
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    async fn pinned(db: &MemoryDatabase, tenant: &str) -> MemoryConnection {
        let mut conn = db.checkout().await.unwrap();
        conn.pin_schema(&schema(tenant)).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn recycled_connection_keeps_stale_search_path() {
        let db = MemoryDatabase::new();
        db.create_schema(&schema("acme"));
        let conn = pinned(&db, "acme").await;
        let id = conn.id();
        db.recycle(conn);

        let reused = db.checkout().await.unwrap();
        assert_eq!(reused.id(), id);
        assert_eq!(reused.pinned_schema(), Some(&schema("acme")));
        assert_eq!(db.stats().recycled, 1);
    }

    #[tokio::test]
    async fn unpinned_connection_refuses_operations() {
        let db = MemoryDatabase::new();
        let mut conn = db.checkout().await.unwrap();
        let err = MemoryEngine
            .find(&mut conn, "Product", &FilterSpec::all(), &FindOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SchemaNotPinned));
    }

    #[tokio::test]
    async fn max_connections_exhausts_source() {
        let db = MemoryDatabase::new().with_max_connections(1);
        let first = db.checkout().await.unwrap();
        assert!(matches!(db.checkout().await, Err(SourceError::Exhausted)));
        db.discard(first);
        assert!(db.checkout().await.is_ok());
    }

    #[tokio::test]
    async fn create_assigns_system_fields_and_enforces_constraints() {
        let db = MemoryDatabase::new();
        db.create_schema(&schema("acme"));
        let mut conn = pinned(&db, "acme").await;
        let spec = SchemaSpec::default().required(["name"]).unique(["sku"]);

        let created = MemoryEngine
            .create(&mut conn, "Product", &spec, record(json!({"id": "forged", "name": "widget", "sku": "W-1"})))
            .await
            .unwrap();
        assert_ne!(created["id"], json!("forged"));
        assert!(created.contains_key("created_at"));

        let dup = MemoryEngine
            .create(&mut conn, "Product", &spec, record(json!({"name": "other", "sku": "W-1"})))
            .await;
        assert!(matches!(dup, Err(StorageError::ConstraintViolation(_))));

        let missing = MemoryEngine.create(&mut conn, "Product", &spec, record(json!({"sku": "W-2"}))).await;
        assert!(matches!(missing, Err(StorageError::ConstraintViolation(_))));

        assert_eq!(db.records(&schema("acme"), "Product").len(), 1);
    }

    #[tokio::test]
    async fn update_reports_matched_and_modified() {
        let db = MemoryDatabase::new();
        db.create_schema(&schema("acme"));
        let mut conn = pinned(&db, "acme").await;
        let spec = SchemaSpec::default();
        for (name, price) in [("a", 1), ("b", 2), ("c", 2)] {
            MemoryEngine
                .create(&mut conn, "Product", &spec, record(json!({"name": name, "price": price})))
                .await
                .unwrap();
        }

        let result = MemoryEngine
            .update(
                &mut conn,
                "Product",
                &spec,
                &FilterSpec::new(json!({"price": {"$gte": 1}})),
                record(json!({"price": 2})),
            )
            .await
            .unwrap();
        assert_eq!(result, UpdateResult { matched: 3, modified: 1 });

        let missing_table = MemoryEngine
            .update(&mut conn, "Nothing", &spec, &FilterSpec::all(), Record::new())
            .await
            .unwrap();
        assert_eq!(missing_table, UpdateResult::default());
    }

    #[tokio::test]
    async fn update_cannot_give_several_rows_the_same_unique_value() {
        let db = MemoryDatabase::new();
        db.create_schema(&schema("acme"));
        let mut conn = pinned(&db, "acme").await;
        let spec = SchemaSpec::default().unique(["sku"]);
        for sku in ["A", "B"] {
            MemoryEngine
                .create(&mut conn, "Product", &spec, record(json!({"sku": sku})))
                .await
                .unwrap();
        }

        let err = MemoryEngine
            .update(&mut conn, "Product", &spec, &FilterSpec::all(), record(json!({"sku": "X"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation(_)));

        let mut skus: Vec<Value> = db
            .records(&schema("acme"), "Product")
            .iter()
            .map(|r| r["sku"].clone())
            .collect();
        skus.sort_by(|a, b| total_cmp(Some(a), Some(b)));
        assert_eq!(skus, vec![json!("A"), json!("B")]);

        // A single matching row may still take the value
        let single = MemoryEngine
            .update(
                &mut conn,
                "Product",
                &spec,
                &FilterSpec::new(json!({"sku": "A"})),
                record(json!({"sku": "X"})),
            )
            .await
            .unwrap();
        assert_eq!(single, UpdateResult { matched: 1, modified: 1 });
    }

    #[tokio::test]
    async fn pin_latency_delays_pinning() {
        let db = MemoryDatabase::new();
        db.create_schema(&schema("acme"));
        db.set_pin_latency(Duration::from_millis(200));
        let mut conn = db.checkout().await.unwrap();

        let pinning = tokio::time::timeout(Duration::from_millis(20), conn.pin_schema(&schema("acme"))).await;
        assert!(pinning.is_err());
        assert_eq!(conn.pinned_schema(), None);
        assert_eq!(db.stats().pins, 0);
    }

    #[tokio::test]
    async fn distinct_is_sorted_and_skips_nulls() {
        let db = MemoryDatabase::new();
        db.create_schema(&schema("acme"));
        let mut conn = pinned(&db, "acme").await;
        let spec = SchemaSpec::default();
        for color in [json!("red"), json!("blue"), json!(null), json!("red")] {
            MemoryEngine
                .create(&mut conn, "Product", &spec, record(json!({"color": color})))
                .await
                .unwrap();
        }
        let colors = MemoryEngine.distinct(&mut conn, "Product", &spec, "color").await.unwrap();
        assert_eq!(colors, vec![json!("blue"), json!("red")]);
    }
}
