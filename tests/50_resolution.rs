mod common;

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use common::{record, tenant, Stack, StackOptions};
use org_tenancy::middleware::{UnitOfWork, TENANT_PARAM};
use org_tenancy::storage::{FilterSpec, FindOptions, Record, SchemaSpec};
use org_tenancy::tenant::{Caller, OrganizationRef, ResolutionMethod, TenantScope};
use org_tenancy::TenancyError;

fn with_fallback() -> StackOptions {
    StackOptions {
        allow_any_tenant_fallback: true,
        ..StackOptions::default()
    }
}

#[tokio::test]
async fn session_tenant_beats_reference_and_membership() -> Result<()> {
    let stack = Stack::new(&[("acme", &["alice"]), ("globex", &["alice"]), ("initech", &[])]).await;
    let caller = Caller::user("alice")
        .with_session_tenant(tenant("initech"))
        .with_organization(OrganizationRef::Unresolved("globex".into()));

    let ctx = stack.resolver.resolve(&caller, None).await?;
    assert_eq!(ctx.tenant_id(), &tenant("initech"));
    assert_eq!(ctx.method(), ResolutionMethod::Session);
    assert_eq!(stack.directory.lookups(), 0);
    Ok(())
}

#[tokio::test]
async fn reference_beats_membership() -> Result<()> {
    let stack = Stack::new(&[("acme", &["alice"]), ("globex", &[])]).await;
    let caller = Caller::user("alice").with_organization(OrganizationRef::Unresolved("globex".into()));

    let ctx = stack.resolver.resolve(&caller, None).await?;
    assert_eq!(ctx.tenant_id(), &tenant("globex"));
    assert_eq!(ctx.method(), ResolutionMethod::Reference);
    assert_eq!(ctx.organization().map(|o| o.name.as_str()), Some("GLOBEX"));
    Ok(())
}

#[tokio::test]
async fn membership_picks_lowest_id_deterministically() -> Result<()> {
    let stack = Stack::new(&[("zeta", &["alice"]), ("beta", &["alice"]), ("mu", &["alice"])]).await;
    for _ in 0..5 {
        let ctx = stack.context_for("alice").await;
        assert_eq!(ctx.tenant_id(), &tenant("beta"));
        assert_eq!(ctx.method(), ResolutionMethod::Membership);
    }

    let chosen = stack.resolver.resolve(&Caller::user("alice"), Some(&tenant("mu"))).await?;
    assert_eq!(chosen.tenant_id(), &tenant("mu"));
    Ok(())
}

#[tokio::test]
async fn fallback_only_when_enabled() -> Result<()> {
    let orgs: &[(&str, &[&str])] = &[("zeta", &[]), ("alpha", &[])];

    let strict = Stack::new(orgs).await;
    let err = strict.resolver.resolve(&Caller::user("nobody"), None).await.unwrap_err();
    assert!(matches!(err, TenancyError::TenantNotFound(_)));

    let lenient = Stack::with_options(orgs, with_fallback()).await;
    let ctx = lenient.resolver.resolve(&Caller::user("nobody"), None).await?;
    assert_eq!(ctx.tenant_id(), &tenant("alpha"));
    assert_eq!(ctx.method(), ResolutionMethod::Fallback);
    Ok(())
}

#[tokio::test]
async fn mismatch_is_rejected_before_any_storage_work() -> Result<()> {
    let stack = Arc::new(Stack::new(&[("acme", &["alice"]), ("globex", &["bob"])]).await);

    let handler_stack = Arc::clone(&stack);
    let handler = Arc::clone(&stack.middleware).wrap(move |scope: TenantScope, _work: UnitOfWork| {
        let stack = Arc::clone(&handler_stack);
        async move {
            let ctx = scope.context().cloned().ok_or_else(|| TenancyError::TenantNotFound("unscoped".into()))?;
            stack
                .adapter
                .find(&ctx, "Product", &FilterSpec::all(), &FindOptions::default())
                .await
        }
    });

    let work = UnitOfWork::new("find")
        .with_caller(Caller::user("alice"))
        .with_param(TENANT_PARAM, "globex");
    let err = handler(work).await.unwrap_err();
    assert!(matches!(err, TenancyError::TenantMismatch { .. }));

    let stats = stack.database.stats();
    assert_eq!(stats.opened, 0);
    assert_eq!(stats.pins, 0);
    assert_eq!(stack.pools.pool_count().await, 0);

    // The same caller naming its own tenant goes through
    let work = UnitOfWork::new("find")
        .with_caller(Caller::user("alice"))
        .with_param(TENANT_PARAM, "acme");
    let rows: Vec<Record> = handler(work).await?;
    assert!(rows.is_empty());
    assert_eq!(stack.database.stats().pins, 1);
    Ok(())
}

#[tokio::test]
async fn privileged_caller_targets_named_tenant() -> Result<()> {
    let stack = Stack::new(&[("acme", &["alice"]), ("globex", &["bob"])]).await;
    let work = UnitOfWork::new("create")
        .with_caller(Caller::privileged("root"))
        .with_param(TENANT_PARAM, "globex");

    let scope = stack.middleware.admit(&work).await?;
    let ctx = scope.context().expect("scoped");
    assert_eq!(ctx.method(), ResolutionMethod::ExplicitParameter);

    stack
        .adapter
        .create(ctx, "Audit", &SchemaSpec::default(), record(json!({"action": "seed"})))
        .await?;
    assert_eq!(stack.database.records(&common::schema("globex"), "Audit").len(), 1);
    Ok(())
}
