//! Version endpoints: batched commits, single edits, history and point
//! rollback.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use branchbase_core::batch::{CommitBatchRequest, CommitBatchResponse};
use branchbase_core::engine::AppendRequest;
use branchbase_core::history::{ChangeRecordView, HistoryQuery};
use branchbase_core::models::{ChangeRecord, EntityType, Record, RollbackResult};
use branchbase_core::rollback::PointRollbackRequest;

use crate::api::status::AppError;
use crate::api::with_author;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<ChangeRecordView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateQuery {
    pub branch_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityStateResponse {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub branch_id: String,
    pub exists: bool,
    pub state: Option<Record>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorRequest {
    pub display_name: String,
}

pub async fn create_batch(
    state: &AppState,
    request: CommitBatchRequest,
) -> Result<CommitBatchResponse, AppError> {
    Ok(state.engine.commit_batch(request).await?)
}

pub async fn append(state: &AppState, request: AppendRequest) -> Result<ChangeRecord, AppError> {
    Ok(state.engine.append(request).await?)
}

pub async fn history(state: &AppState, query: HistoryQuery) -> Result<HistoryResponse, AppError> {
    Ok(HistoryResponse {
        history: state.engine.history(query).await?,
    })
}

pub async fn rollback(
    state: &AppState,
    request: PointRollbackRequest,
) -> Result<RollbackResult, AppError> {
    Ok(state.engine.restore_version(request).await?)
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/version/batch", post(create_batch_handler))
        .route("/api/version/append", post(append_handler))
        .route("/api/version/history", post(history_handler))
        .route("/api/version/rollback", post(rollback_handler))
        .route("/api/entities/:entity_type/:entity_id", get(entity_state))
        .route("/api/authors/:id", put(register_author))
}

async fn create_batch_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CommitBatchRequest>,
) -> Result<Json<CommitBatchResponse>, AppError> {
    Ok(Json(create_batch(&state, with_author(body, &state, &headers)).await?))
}

async fn append_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AppendRequest>,
) -> Result<Json<ChangeRecord>, AppError> {
    Ok(Json(append(&state, with_author(body, &state, &headers)).await?))
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    Ok(Json(history(&state, body).await?))
}

async fn rollback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PointRollbackRequest>,
) -> Result<Json<RollbackResult>, AppError> {
    Ok(Json(rollback(&state, with_author(body, &state, &headers)).await?))
}

async fn entity_state(
    State(state): State<Arc<AppState>>,
    Path((entity_type, entity_id)): Path<(String, String)>,
    Query(query): Query<StateQuery>,
) -> Result<Json<EntityStateResponse>, AppError> {
    let entity_type = EntityType::parse(&entity_type)
        .ok_or_else(|| AppError::BadRequest(format!("unknown entity type '{entity_type}'")))?;
    let current = state
        .engine
        .current_state(entity_type, &entity_id, &query.branch_id)
        .await?;
    Ok(Json(EntityStateResponse {
        entity_type,
        entity_id,
        branch_id: query.branch_id,
        exists: current.is_some(),
        state: current,
    }))
}

async fn register_author(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AuthorRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.engine.register_author(&id, &body.display_name).await?;
    Ok(Json(serde_json::json!({ "ok": true, "id": id })))
}
