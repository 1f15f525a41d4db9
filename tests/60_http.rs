mod common;

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::{json, Value};

use common::{master_token, token_for, Stack, TestServer};

async fn server() -> Result<(Stack, TestServer)> {
    let stack = Stack::new(&[("acme", &["alice"]), ("globex", &["bob"])]).await;
    let server = TestServer::spawn(stack.router()).await?;
    Ok((stack, server))
}

#[tokio::test]
async fn health_is_tenant_agnostic() -> Result<()> {
    let (_stack, server) = server().await?;
    let res = reqwest::get(format!("{}/health", server.base_url)).await?;
    assert_eq!(res.status(), StatusCode::OK);

    let body = res.json::<Value>().await?;
    assert_eq!(body["data"]["status"], json!("ok"));
    Ok(())
}

#[tokio::test]
async fn health_ignores_a_stale_token() -> Result<()> {
    let (_stack, server) = server().await?;
    let res = reqwest::Client::new()
        .get(format!("{}/health", server.base_url))
        .bearer_auth("expired-or-garbage")
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn data_routes_require_a_token() -> Result<()> {
    let (stack, server) = server().await?;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/api/find/Product", server.base_url))
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(format!("{}/api/find/Product", server.base_url))
        .bearer_auth("garbage")
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body = res.json::<Value>().await?;
    assert_eq!(body["code"], json!("UNAUTHORIZED"));

    assert_eq!(stack.database.stats().opened, 0);
    Ok(())
}

#[tokio::test]
async fn member_reads_and_writes_own_tenant() -> Result<()> {
    let (_stack, server) = server().await?;
    let client = reqwest::Client::new();
    let alice = token_for("alice");
    let bob = token_for("bob");

    let res = client
        .post(format!("{}/api/create/Product", server.base_url))
        .bearer_auth(&alice)
        .json(&json!({"record": {"name": "widget", "price": 5}}))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::CREATED);
    let created = res.json::<Value>().await?;
    assert!(created["data"]["id"].is_string());

    let res = client
        .post(format!("{}/api/find/Product", server.base_url))
        .bearer_auth(&alice)
        .json(&json!({"filter": {"price": {"$gte": 1}}, "order": "name"}))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let found = res.json::<Value>().await?;
    assert_eq!(found["data"].as_array().map(Vec::len), Some(1));

    let res = client
        .post(format!("{}/api/count/Product", server.base_url))
        .bearer_auth(&bob)
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(res.json::<Value>().await?["data"], json!(0));

    let res = client
        .get(format!("{}/api/context", server.base_url))
        .bearer_auth(&bob)
        .send()
        .await?;
    let context = res.json::<Value>().await?;
    assert_eq!(context["data"]["tenant_id"], json!("globex"));
    assert_eq!(context["data"]["method"], json!("membership"));
    Ok(())
}

#[tokio::test]
async fn asserting_a_foreign_tenant_is_forbidden() -> Result<()> {
    let (stack, server) = server().await?;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/api/create/Product", server.base_url))
        .bearer_auth(token_for("alice"))
        .header("X-Organization-Id", "globex")
        .json(&json!({"record": {"name": "smuggled"}}))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = client
        .post(format!("{}/api/find/Product?organizationId=globex", server.base_url))
        .bearer_auth(token_for("alice"))
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    assert!(stack.database.records(&common::schema("globex"), "Product").is_empty());
    assert_eq!(stack.database.stats().pins, 0);
    Ok(())
}

#[tokio::test]
async fn conflicting_tenant_assertions_are_forbidden() -> Result<()> {
    let (stack, server) = server().await?;

    let res = reqwest::Client::new()
        .post(format!("{}/api/create/Product?organizationId=globex", server.base_url))
        .bearer_auth(token_for("alice"))
        .header("X-Organization-Id", "acme")
        .json(&json!({"record": {"name": "ambiguous"}}))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    assert!(stack.database.records(&common::schema("acme"), "Product").is_empty());
    assert_eq!(stack.database.stats().pins, 0);
    Ok(())
}

#[tokio::test]
async fn master_token_needs_an_explicit_tenant_for_data() -> Result<()> {
    let (stack, server) = server().await?;
    let client = reqwest::Client::new();
    let root = master_token();

    let res = client
        .post(format!("{}/api/count/Product", server.base_url))
        .bearer_auth(&root)
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(format!("{}/api/create/Product?organizationId=globex", server.base_url))
        .bearer_auth(&root)
        .json(&json!({"record": {"name": "seeded"}}))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(stack.database.records(&common::schema("globex"), "Product").len(), 1);
    Ok(())
}

#[tokio::test]
async fn storage_errors_map_to_client_statuses() -> Result<()> {
    let (_stack, server) = server().await?;
    let client = reqwest::Client::new();
    let alice = token_for("alice");

    let res = client
        .post(format!("{}/api/find/Product", server.base_url))
        .bearer_auth(&alice)
        .json(&json!({"filter": {"name": {"$regex": "w.*"}}}))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let unique = json!({"record": {"sku": "W-1"}, "schema": {"unique": ["sku"]}});
    for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
        let res = client
            .post(format!("{}/api/create/Product", server.base_url))
            .bearer_auth(&alice)
            .json(&unique)
            .send()
            .await?;
        assert_eq!(res.status(), expected);
    }

    let res = client
        .post(format!("{}/api/aggregate/Product", server.base_url))
        .bearer_auth(&alice)
        .json(&json!({"pipeline": [{"$count": "n"}]}))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.json::<Value>().await?["data"][0]["n"], json!(1));
    Ok(())
}
