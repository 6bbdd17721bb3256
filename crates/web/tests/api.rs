//! HTTP-level tests for the branchbase API.
//!
//! Each test builds the real router over an in-memory database and drives it
//! with `tower::ServiceExt::oneshot`; no sockets are opened.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use branchbase_core::config::AppConfig;
use branchbase_core::db::Database;
use branchbase_core::engine::Engine;
use branchbase_web::WebServer;

// ===========================================================================
// Helpers
// ===========================================================================

fn app() -> Router {
    let config = AppConfig::default();
    let db = Database::open_in_memory_initialized().unwrap();
    let engine = Arc::new(Engine::new(Arc::new(db), config.engine.clone()));
    WebServer::new(config, engine).router()
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn dispatch(app: &Router, action: &str, params: Value) -> (StatusCode, Value) {
    call(
        app,
        "POST",
        "/api/dispatch",
        Some(json!({ "action": action, "params": params })),
    )
    .await
}

async fn dispatch_as(app: &Router, author: &str, action: &str, params: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/api/dispatch")
        .header("content-type", "application/json")
        .header("x-author-id", author)
        .body(Body::from(json!({ "action": action, "params": params }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

/// Default branch `main` with rule R1, plus a `dev` branch forked from it.
async fn seeded(app: &Router) -> (String, String) {
    let (status, branches) = call(app, "GET", "/api/branches", None).await;
    assert_eq!(status, StatusCode::OK);
    let main = branches[0]["id"].as_str().unwrap().to_string();

    let (status, _) = call(
        app,
        "POST",
        "/api/version/append",
        Some(json!({
            "entityType": "rules",
            "entityId": "R1",
            "branchId": main,
            "changeType": "CREATE",
            "afterData": {"name": "A", "active": true},
            "authorId": "alice"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, dev) = call(
        app,
        "POST",
        "/api/branches",
        Some(json!({"name": "dev", "description": "feature work", "createdBy": "bob"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    (main, dev["id"].as_str().unwrap().to_string())
}

async fn edit(app: &Router, branch: &str, after: Value, author: &str) {
    let (status, body) = call(
        app,
        "POST",
        "/api/version/append",
        Some(json!({
            "entityType": "Rule",
            "entityId": "R1",
            "branchId": branch,
            "changeType": "UPDATE",
            "afterData": after,
            "authorId": author
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = call(&app, "GET", "/api/status/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn test_branch_lifecycle() {
    let app = app();
    let (main, dev) = seeded(&app).await;

    let (_, branches) = dispatch(&app, "branches.list", Value::Null).await;
    let names: Vec<&str> = branches
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["main", "dev"]);
    assert_eq!(branches[1]["parentBranchId"], main.as_str());

    let (status, locked) = call(&app, "POST", &format!("/api/branches/{dev}/lock"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(locked["isLocked"], true);

    let (status, body) = call(
        &app,
        "POST",
        &format!("/api/branches/{dev}/switch"),
        Some(json!({"userId": "bob"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation_error");

    call(&app, "POST", &format!("/api/branches/{dev}/unlock"), None).await;
    let (status, ctx) = call(
        &app,
        "POST",
        &format!("/api/branches/{dev}/switch"),
        Some(json!({"userId": "bob"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ctx["branchName"], "dev");

    let (status, _) = call(&app, "DELETE", &format!("/api/branches/{main}"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(&app, "DELETE", &format!("/api/branches/{dev}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&app, "GET", &format!("/api/branches/{dev}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["entity"], "branch");
}

#[tokio::test]
async fn test_preview_and_merge() {
    let app = app();
    let (main, dev) = seeded(&app).await;
    edit(&app, &dev, json!({"name": "A", "active": false}), "bob").await;

    let (status, preview) = dispatch(
        &app,
        "branches.getMergePreview",
        json!({"sourceBranchId": dev, "targetBranchId": main}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(preview["modifiedCount"], 1);
    assert_eq!(preview["conflicts"].as_array().unwrap().len(), 0);

    let (status, event) = call(
        &app,
        "POST",
        "/api/branches/merge",
        Some(json!({
            "sourceBranchId": dev,
            "targetBranchId": main,
            "strategy": "AUTO",
            "conflictResolution": "MANUAL",
            "authorId": "bob"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{event}");
    assert_eq!(event["affectedEntities"][0]["changeType"], "MODIFIED");
    assert_eq!(event["affectedEntities"][0]["hasConflict"], false);

    let (_, state) = call(&app, "GET", &format!("/api/entities/rules/R1?branchId={main}"), None).await;
    assert_eq!(state["state"]["active"], false);
}

#[tokio::test]
async fn test_conflict_is_structured() {
    let app = app();
    let (main, dev) = seeded(&app).await;
    edit(&app, &dev, json!({"name": "A2", "active": true}), "bob").await;
    edit(&app, &main, json!({"name": "A-main", "active": true}), "alice").await;

    let (status, body) = dispatch(
        &app,
        "branches.merge",
        json!({
            "sourceBranchId": dev,
            "targetBranchId": main,
            "conflictResolution": "ABORT_ON_CONFLICT",
            "authorId": "bob"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict_error");
    assert_eq!(body["conflicts"][0]["entityId"], "R1");
    assert_eq!(body["conflicts"][0]["conflictType"], "FIELD_CONFLICT");
    assert_eq!(body["conflicts"][0]["fields"][0]["field"], "name");
}

#[tokio::test]
async fn test_rollback_actions() {
    let app = app();
    let (main, dev) = seeded(&app).await;
    edit(&app, &dev, json!({"name": "A", "active": false}), "bob").await;
    let (_, event) = dispatch(
        &app,
        "branches.merge",
        json!({"sourceBranchId": dev, "targetBranchId": main, "authorId": "bob"}),
    )
    .await;
    let event_id = event["id"].as_str().unwrap().to_string();

    let (status, candidates) = dispatch(
        &app,
        "branches.rollback",
        json!({"branchId": main, "limit": 5}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(candidates[0]["id"], event_id.as_str());
    assert_eq!(candidates[0]["canRevert"], true);

    let (status, body) = call(
        &app,
        "POST",
        "/api/rollback/merge",
        Some(json!({"mergeEventId": event_id, "strategy": "DIRECT_ROLLBACK", "authorId": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, result) = dispatch(
        &app,
        "rollback.selective",
        json!({"mergeEventId": event_id, "selectedEntities": ["R1"], "authorId": "alice"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{result}");
    assert_eq!(result["strategy"], "SELECTIVE_REVERT");
    assert_eq!(result["records"][0]["changeType"], "ROLLBACK");

    let (_, state) = call(&app, "GET", &format!("/api/entities/Rule/R1?branchId={main}"), None).await;
    assert_eq!(state["state"]["active"], true);
}

#[tokio::test]
async fn test_batch_history_and_point_rollback() {
    let app = app();
    let (main, _) = seeded(&app).await;
    let (status, _) = call(
        &app,
        "PUT",
        "/api/authors/alice",
        Some(json!({"displayName": "Alice A."})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let batch = json!({
        "batchId": "batch-1",
        "resourceType": "rules",
        "tenantId": "default",
        "branchId": main,
        "description": "bulk edit",
        "tags": ["ui"],
        "authorId": "alice",
        "changes": [
            {"entityType": "Rule", "entityId": "R1", "operation": "UPDATE",
             "afterData": {"name": "A", "active": false}},
            {"entityType": "Rule", "entityId": "R2", "operation": "CREATE",
             "afterData": {"name": "B"}}
        ]
    });
    let (status, first) = dispatch(&app, "version.createBatch", batch.clone()).await;
    assert_eq!(status, StatusCode::OK, "{first}");
    assert_eq!(first["recordCount"], 2);
    let (_, again) = call(&app, "POST", "/api/version/batch", Some(batch)).await;
    assert_eq!(again["versionId"], first["versionId"]);
    assert_eq!(again["replayed"], true);

    let (status, history) = dispatch(
        &app,
        "version.getHistory",
        json!({"entityType": "Rule", "entityId": "R1", "tenantId": "default",
               "branchId": main, "includeFieldChanges": true, "includeContent": true}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = history["history"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["authorName"], "Alice A.");
    assert_eq!(entries[0]["batchId"], "batch-1");
    let original_sha = entries[1]["sha"].as_str().unwrap().to_string();

    let (status, result) = dispatch(
        &app,
        "version.rollback",
        json!({"entityType": "Rule", "entityId": "R1", "targetVersionSha": original_sha,
               "tenantId": "default", "branchId": main, "reason": "undo bulk edit",
               "authorId": "alice"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{result}");
    let (_, state) = call(&app, "GET", &format!("/api/entities/rules/R1?branchId={main}"), None).await;
    assert_eq!(state["state"]["active"], true);
}

#[tokio::test]
async fn test_unknown_action() {
    let app = app();
    let (status, body) = dispatch(&app, "branches.explode", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("branches.list"));
}

#[tokio::test]
async fn test_actions_without_author_id() {
    let app = app();
    let (main, dev) = seeded(&app).await;
    edit(&app, &dev, json!({"name": "A", "active": false}), "bob").await;

    let (status, event) = dispatch(
        &app,
        "branches.merge",
        json!({"sourceBranchId": dev, "targetBranchId": main, "strategy": "AUTO",
               "conflictResolution": "ABORT_ON_CONFLICT", "message": "ship it"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{event}");
    assert_eq!(event["authorId"], "system");
    let first_merge = event["id"].as_str().unwrap().to_string();

    let (status, result) = dispatch(
        &app,
        "rollback.merge",
        json!({"mergeEventId": first_merge, "strategy": "CREATE_REVERT_COMMIT",
               "message": "undo ship"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{result}");
    assert_eq!(result["authorId"], "system");
    assert_eq!(result["records"][0]["authorId"], "system");

    // A header names the author when the body does not.
    let (status, _) = dispatch_as(
        &app,
        "carol",
        "version.append",
        json!({"entityType": "Rule", "entityId": "R2", "branchId": dev,
               "changeType": "CREATE", "afterData": {"name": "B"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, event) = dispatch_as(
        &app,
        "carol",
        "branches.merge",
        json!({"sourceBranchId": dev, "targetBranchId": main, "strategy": "SELECTIVE",
               "conflictResolution": "ABORT_ON_CONFLICT", "message": "just R2",
               "selectedChanges": ["R2"]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{event}");
    assert_eq!(event["authorId"], "carol");
    let second_merge = event["id"].as_str().unwrap().to_string();

    let (status, result) = dispatch(
        &app,
        "rollback.selective",
        json!({"mergeEventId": second_merge, "selectedEntities": ["R2"],
               "strategy": "SELECTIVE_REVERT", "message": "drop R2"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{result}");
    assert_eq!(result["authorId"], "system");

    let (status, batch) = dispatch(
        &app,
        "version.createBatch",
        json!({"batchId": "batch-anon", "resourceType": "rules", "tenantId": "default",
               "branchId": main, "description": "bulk", "tags": [],
               "changes": [{"entityType": "Rule", "entityId": "R1", "operation": "UPDATE",
                            "afterData": {"name": "Z", "active": true}}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{batch}");

    let (_, history) = dispatch(
        &app,
        "version.getHistory",
        json!({"entityType": "Rule", "entityId": "R1", "tenantId": "default",
               "branchId": main, "includeFieldChanges": false, "includeContent": false}),
    )
    .await;
    let entries = history["history"].as_array().unwrap();
    assert_eq!(entries[0]["batchId"], "batch-anon");
    assert_eq!(entries[0]["authorId"], "system");
    let created_sha = entries.last().unwrap()["sha"].as_str().unwrap().to_string();

    let (status, result) = dispatch(
        &app,
        "version.rollback",
        json!({"entityType": "Rule", "entityId": "R1", "targetVersionSha": created_sha,
               "tenantId": "default", "branchId": main, "reason": "start over"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{result}");
    assert_eq!(result["authorId"], "system");
}
