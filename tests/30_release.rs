mod common;

use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use common::{record, schema, tenant, Stack, StackOptions};
use org_tenancy::storage::{FilterSpec, FindOptions, SchemaSpec, StorageError};
use org_tenancy::TenancyError;

async fn leased(stack: &Stack, id: &str) -> usize {
    stack.pools.stats(&tenant(id)).await.map(|s| s.leased).unwrap_or(0)
}

#[tokio::test]
async fn released_after_engine_error() -> Result<()> {
    let stack = Stack::new(&[("acme", &["alice"])]).await;
    let alice = stack.context_for("alice").await;
    let spec = SchemaSpec::default().required(["name"]);

    let err = stack
        .adapter
        .create(&alice, "Product", &spec, record(json!({"price": 1})))
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::Storage(StorageError::ConstraintViolation(_))));

    assert_eq!(leased(&stack, "acme").await, 0);
    let stats = stack.database.stats();
    assert_eq!(stats.recycled, 1);
    assert_eq!(stats.discarded, 0);
    Ok(())
}

#[tokio::test]
async fn discarded_after_operation_timeout() -> Result<()> {
    let options = StackOptions {
        operation_timeout: Some(Duration::from_millis(20)),
        ..StackOptions::default()
    };
    let stack = Stack::with_options(&[("acme", &["alice"])], options).await;
    let alice = stack.context_for("alice").await;
    stack.database.set_latency(Duration::from_millis(250));

    let err = stack
        .adapter
        .find(&alice, "Product", &FilterSpec::all(), &FindOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::OperationTimeout { .. }));

    assert_eq!(leased(&stack, "acme").await, 0);
    let stats = stack.database.stats();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.idle, 0);
    Ok(())
}

#[tokio::test]
async fn discarded_when_caller_cancels() -> Result<()> {
    let stack = Stack::new(&[("acme", &["alice"])]).await;
    let alice = stack.context_for("alice").await;
    stack.database.set_latency(Duration::from_millis(250));

    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        stack.adapter.find(&alice, "Product", &FilterSpec::all(), &FindOptions::default()),
    )
    .await;
    assert!(cancelled.is_err(), "operation should still have been running");

    assert_eq!(leased(&stack, "acme").await, 0);
    let stats = stack.database.stats();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.recycled, 0);
    Ok(())
}

#[tokio::test]
async fn pin_failure_leaves_nothing_leased() -> Result<()> {
    let stack = Stack::new(&[("acme", &["alice"])]).await;
    let alice = stack.context_for("alice").await;
    stack.database.reject_pins(&schema("acme"));

    let err = stack
        .adapter
        .count(&alice, "Product", &SchemaSpec::default(), &FilterSpec::all())
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::SchemaPinFailed { .. }));

    assert_eq!(leased(&stack, "acme").await, 0);
    assert_eq!(stack.database.stats().discarded, 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_pool_times_out_then_recovers() -> Result<()> {
    let options = StackOptions {
        tenant_pool_size: 1,
        acquire_timeout: Duration::from_millis(50),
        ..StackOptions::default()
    };
    let stack = Stack::with_options(&[("acme", &["alice"]), ("globex", &["bob"])], options).await;
    let alice = stack.context_for("alice").await;
    let bob = stack.context_for("bob").await;

    let held = stack.adapter.session(&alice).await?;
    let err = stack
        .adapter
        .count(&alice, "Product", &SchemaSpec::default(), &FilterSpec::all())
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::PoolTimeout { .. }));
    assert_eq!(leased(&stack, "acme").await, 1);

    // Another tenant's pool is unaffected
    stack.adapter.count(&bob, "Product", &SchemaSpec::default(), &FilterSpec::all()).await?;

    held.finish();
    stack.adapter.count(&alice, "Product", &SchemaSpec::default(), &FilterSpec::all()).await?;
    assert_eq!(leased(&stack, "acme").await, 0);
    Ok(())
}
