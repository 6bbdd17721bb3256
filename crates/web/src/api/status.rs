//! Health endpoint and the shared API error type.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::error;

use branchbase_core::errors::{ConflictError, EngineError};

use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: String,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/status/health", get(health_check))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ---------------------------------------------------------------------------
// Shared error type for API handlers
// ---------------------------------------------------------------------------

/// API error that converts to a structured JSON response.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Internal(String),
    Engine(EngineError),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let e = match self {
            AppError::BadRequest(msg) => {
                let body = json!({ "error": msg, "kind": "bad_request" });
                return (StatusCode::BAD_REQUEST, Json(body)).into_response();
            }
            AppError::Internal(msg) => {
                error!(error = %msg, "internal API error");
                let body = json!({ "error": msg, "kind": "internal" });
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
            }
            AppError::Engine(e) => e,
        };

        let message = e.to_string();
        let kind = e.kind();
        let (status, details) = match e {
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, json!({})),
            EngineError::NotFound { entity, id } => {
                (StatusCode::NOT_FOUND, json!({ "entity": entity, "id": id }))
            }
            EngineError::Conflict(ConflictError::Conflicts { conflicts }) => {
                (StatusCode::CONFLICT, json!({ "conflicts": conflicts }))
            }
            EngineError::Conflict(ConflictError::Unresolved {
                entity_ids,
                conflicts,
            }) => (
                StatusCode::CONFLICT,
                json!({ "unresolvedEntityIds": entity_ids, "conflicts": conflicts }),
            ),
            EngineError::Conflict(ConflictError::NotFastForwardable {
                target_branch_id,
                target_changes,
            }) => (
                StatusCode::CONFLICT,
                json!({ "targetBranchId": target_branch_id, "targetChanges": target_changes }),
            ),
            EngineError::BlockedRollback { blockers } => {
                (StatusCode::CONFLICT, json!({ "blockers": blockers }))
            }
            EngineError::ConcurrentMerge {
                branch_id,
                waited_ms,
            } => (
                StatusCode::LOCKED,
                json!({ "branchId": branch_id, "waitedMs": waited_ms }),
            ),
            EngineError::TimedOut(ms) => (StatusCode::GATEWAY_TIMEOUT, json!({ "timeoutMs": ms })),
            EngineError::Persistence(_) | EngineError::Cancelled => {
                error!(error = %message, "engine failure");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({}))
            }
        };

        let mut body = json!({ "error": message, "kind": kind });
        if let (Some(body), serde_json::Value::Object(details)) = (body.as_object_mut(), details) {
            body.extend(details);
        }
        (status, Json(body)).into_response()
    }
}
