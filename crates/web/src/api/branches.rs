//! Branch and merge endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;

use branchbase_core::branches::NewBranch;
use branchbase_core::merge::{MergePreview, MergeRequest};
use branchbase_core::models::{Branch, BranchContext, MergeEvent, RollbackCandidate};

use crate::api::status::AppError;
use crate::api::with_author;
use crate::AppState;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantQuery {
    pub tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBranchRequest {
    #[serde(flatten)]
    pub branch: NewBranch,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub source_branch_id: String,
    pub target_branch_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatesRequest {
    pub branch_id: String,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

const DEFAULT_CANDIDATE_LIMIT: u32 = 20;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

pub async fn list(state: &AppState, query: TenantQuery) -> Result<Vec<Branch>, AppError> {
    Ok(state.engine.list_branches(query.tenant_id.as_deref()).await?)
}

pub async fn create(state: &AppState, request: CreateBranchRequest) -> Result<Branch, AppError> {
    let created_by = request
        .created_by
        .as_deref()
        .unwrap_or(&state.config.web.default_author);
    Ok(state
        .engine
        .create_branch(request.tenant_id.as_deref(), created_by, request.branch)
        .await?)
}

pub async fn merge(state: &AppState, request: MergeRequest) -> Result<MergeEvent, AppError> {
    Ok(state.engine.merge(request).await?)
}

pub async fn preview(state: &AppState, request: PreviewRequest) -> Result<MergePreview, AppError> {
    Ok(state
        .engine
        .merge_preview(&request.source_branch_id, &request.target_branch_id)
        .await?)
}

pub async fn candidates(
    state: &AppState,
    request: CandidatesRequest,
) -> Result<Vec<RollbackCandidate>, AppError> {
    let limit = request.limit.unwrap_or(DEFAULT_CANDIDATE_LIMIT).clamp(1, 200);
    Ok(state
        .engine
        .rollback_candidates(&request.branch_id, limit)
        .await?)
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/branches", get(list_branches).post(create_branch))
        .route("/api/branches/merge", post(merge_branches))
        .route("/api/branches/merge-preview", post(merge_preview))
        .route("/api/branches/:id", get(get_branch).delete(delete_branch))
        .route("/api/branches/:id/lock", post(lock_branch))
        .route("/api/branches/:id/unlock", post(unlock_branch))
        .route("/api/branches/:id/switch", post(switch_branch))
        .route("/api/branches/:id/collaborators", post(add_collaborator))
        .route(
            "/api/branches/:id/collaborators/:user_id",
            delete(remove_collaborator),
        )
        .route("/api/branches/:id/rollback-candidates", get(rollback_candidates))
        .route("/api/merge-events/:id", get(get_merge_event))
}

async fn list_branches(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> Result<Json<Vec<Branch>>, AppError> {
    Ok(Json(list(&state, query).await?))
}

async fn create_branch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBranchRequest>,
) -> Result<Json<Branch>, AppError> {
    Ok(Json(create(&state, body).await?))
}

async fn get_branch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Branch>, AppError> {
    Ok(Json(state.engine.get_branch(&id).await?))
}

async fn delete_branch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.engine.delete_branch(&id).await?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "message": format!("branch {} deleted", id),
    })))
}

async fn lock_branch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Branch>, AppError> {
    Ok(Json(state.engine.lock_branch(&id).await?))
}

async fn unlock_branch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Branch>, AppError> {
    Ok(Json(state.engine.unlock_branch(&id).await?))
}

async fn switch_branch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UserRequest>,
) -> Result<Json<BranchContext>, AppError> {
    Ok(Json(state.engine.switch_branch(&body.user_id, &id).await?))
}

async fn add_collaborator(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UserRequest>,
) -> Result<Json<Branch>, AppError> {
    Ok(Json(state.engine.add_collaborator(&id, &body.user_id).await?))
}

async fn remove_collaborator(
    State(state): State<Arc<AppState>>,
    Path((id, user_id)): Path<(String, String)>,
) -> Result<Json<Branch>, AppError> {
    Ok(Json(state.engine.remove_collaborator(&id, &user_id).await?))
}

async fn merge_branches(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<MergeRequest>,
) -> Result<Json<MergeEvent>, AppError> {
    Ok(Json(merge(&state, with_author(body, &state, &headers)).await?))
}

async fn merge_preview(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PreviewRequest>,
) -> Result<Json<MergePreview>, AppError> {
    Ok(Json(preview(&state, body).await?))
}

async fn rollback_candidates(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<RollbackCandidate>>, AppError> {
    let request = CandidatesRequest {
        branch_id: id,
        limit: query.limit,
    };
    Ok(Json(candidates(&state, request).await?))
}

async fn get_merge_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MergeEvent>, AppError> {
    Ok(Json(state.engine.merge_event(&id).await?))
}
