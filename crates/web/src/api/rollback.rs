//! Merge rollback endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use branchbase_core::models::{RollbackResult, RollbackStrategy};
use branchbase_core::rollback::RollbackRequest;

use crate::api::status::AppError;
use crate::api::with_author;
use crate::AppState;

/// Body of `rollback.selective`; the strategy defaults to `SELECTIVE_REVERT`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectiveRequest {
    pub merge_event_id: String,
    #[serde(default, alias = "entityIds")]
    pub selected_entities: Vec<String>,
    #[serde(default)]
    pub strategy: Option<RollbackStrategy>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub author_id: String,
    #[serde(default)]
    pub confirm_irreversible: bool,
}

/// `rollback.merge`. `DIRECT_ROLLBACK` is routed to the confirmed
/// destructive operation.
pub async fn merge(state: &AppState, request: RollbackRequest) -> Result<RollbackResult, AppError> {
    if request.strategy == RollbackStrategy::DirectRollback {
        return Ok(state.engine.direct_rollback(request.into()).await?);
    }
    Ok(state.engine.rollback(request).await?)
}

pub async fn selective(
    state: &AppState,
    request: SelectiveRequest,
) -> Result<RollbackResult, AppError> {
    let request = RollbackRequest {
        merge_event_id: request.merge_event_id,
        strategy: request.strategy.unwrap_or(RollbackStrategy::SelectiveRevert),
        entity_ids: request.selected_entities,
        message: request.message,
        author_id: request.author_id,
        confirm_irreversible: request.confirm_irreversible,
    };
    merge(state, request).await
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/rollback/merge", post(rollback_merge))
        .route("/api/rollback/selective", post(rollback_selective))
}

async fn rollback_merge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RollbackRequest>,
) -> Result<Json<RollbackResult>, AppError> {
    Ok(Json(merge(&state, with_author(body, &state, &headers)).await?))
}

async fn rollback_selective(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SelectiveRequest>,
) -> Result<Json<RollbackResult>, AppError> {
    Ok(Json(selective(&state, with_author(body, &state, &headers)).await?))
}
