mod common;

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use common::{record, schema, tenant, Stack, StackOptions};
use org_tenancy::storage::{FilterSpec, SchemaSpec};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_concurrent_creates_land_in_the_right_schemas() -> Result<()> {
    let options = StackOptions {
        max_connections: Some(6),
        tenant_pool_size: 3,
        acquire_timeout: std::time::Duration::from_secs(5),
        ..StackOptions::default()
    };
    let stack = Arc::new(Stack::with_options(&[("acme", &["alice"]), ("globex", &["bob"])], options).await);
    let alice = stack.context_for("alice").await;
    let bob = stack.context_for("bob").await;

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let stack = Arc::clone(&stack);
            let (ctx, owner) = if i % 2 == 0 { (alice.clone(), "acme") } else { (bob.clone(), "globex") };
            tokio::spawn(async move {
                stack
                    .adapter
                    .create(&ctx, "Event", &SchemaSpec::default(), record(json!({"seq": i, "owner": owner})))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await??;
    }

    for (ctx, owner) in [(&alice, "acme"), (&bob, "globex")] {
        let total = stack.adapter.count(ctx, "Event", &SchemaSpec::default(), &FilterSpec::all()).await?;
        assert_eq!(total, 25, "{} should hold 25 events", owner);

        let foreign = stack
            .adapter
            .count(ctx, "Event", &SchemaSpec::default(), &FilterSpec::new(json!({"owner": {"$ne": owner}})))
            .await?;
        assert_eq!(foreign, 0, "{} holds another tenant's events", owner);

        assert_eq!(stack.database.records(&schema(owner), "Event").len(), 25);
        assert_eq!(stack.pools.stats(&tenant(owner)).await.map(|s| s.leased), Some(0));
    }

    assert_eq!(stack.pools.pool_count().await, 2);
    assert!(stack.database.stats().opened <= 6);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sessions_for_different_tenants_run_side_by_side() -> Result<()> {
    let stack = Arc::new(Stack::new(&[("acme", &["alice"]), ("globex", &["bob"])]).await);
    let alice = stack.context_for("alice").await;
    let bob = stack.context_for("bob").await;

    let mut acme = stack.adapter.session(&alice).await?;
    let mut globex = stack.adapter.session(&bob).await?;
    let spec = SchemaSpec::default();

    let (a, b) = tokio::join!(
        acme.create("Note", &spec, record(json!({"text": "from acme"}))),
        globex.create("Note", &spec, record(json!({"text": "from globex"}))),
    );
    a?;
    b?;

    assert_eq!(acme.count("Note", &spec, &FilterSpec::all()).await?, 1);
    assert_eq!(globex.count("Note", &spec, &FilterSpec::all()).await?, 1);
    acme.finish();
    globex.finish();
    Ok(())
}
