//! Generic action-dispatch endpoint.
//!
//! `POST /api/dispatch` with `{"action": "branches.merge", "params": {...}}`
//! runs the same action as the matching REST route and returns its result.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::api::status::AppError;
use crate::api::{branches, rollback, version, with_author, Authored};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

/// Every action name accepted by the dispatch endpoint.
pub const ACTIONS: &[&str] = &[
    "branches.list",
    "branches.create",
    "branches.merge",
    "branches.getMergePreview",
    "branches.rollback",
    "rollback.merge",
    "rollback.selective",
    "version.createBatch",
    "version.append",
    "version.getHistory",
    "version.rollback",
];

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/dispatch", post(dispatch))
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DispatchRequest>,
) -> Result<Json<Value>, AppError> {
    debug!(action = %body.action, "dispatching action");
    let params = body.params;
    let result = match body.action.as_str() {
        "branches.list" => reply(branches::list(&state, params_or_default(params)?).await?),
        "branches.create" => reply(branches::create(&state, parse(params)?).await?),
        "branches.merge" => {
            reply(branches::merge(&state, authored(params, &state, &headers)?).await?)
        }
        "branches.getMergePreview" => reply(branches::preview(&state, parse(params)?).await?),
        "branches.rollback" => reply(branches::candidates(&state, parse(params)?).await?),
        "rollback.merge" => {
            reply(rollback::merge(&state, authored(params, &state, &headers)?).await?)
        }
        "rollback.selective" => {
            reply(rollback::selective(&state, authored(params, &state, &headers)?).await?)
        }
        "version.createBatch" => {
            reply(version::create_batch(&state, authored(params, &state, &headers)?).await?)
        }
        "version.append" => {
            reply(version::append(&state, authored(params, &state, &headers)?).await?)
        }
        "version.getHistory" => reply(version::history(&state, parse(params)?).await?),
        "version.rollback" => {
            reply(version::rollback(&state, authored(params, &state, &headers)?).await?)
        }
        other => Err(AppError::BadRequest(format!(
            "unknown action '{other}'; expected one of: {}",
            ACTIONS.join(", ")
        ))),
    }?;
    Ok(Json(result))
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, AppError> {
    serde_json::from_value(params).map_err(|e| AppError::BadRequest(format!("invalid params: {e}")))
}

fn authored<T: DeserializeOwned + Authored>(
    params: Value,
    state: &AppState,
    headers: &HeaderMap,
) -> Result<T, AppError> {
    Ok(with_author(parse(params)?, state, headers))
}

fn params_or_default<T: DeserializeOwned + Default>(params: Value) -> Result<T, AppError> {
    if params.is_null() {
        Ok(T::default())
    } else {
        parse(params)
    }
}

fn reply<T: Serialize>(value: T) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|e| AppError::Internal(format!("unserializable result: {e}")))
}
