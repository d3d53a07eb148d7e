//! Call read API + explicit terminate.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use vox_domain::model::{EventSource, TerminatedBy};

use crate::api::respond::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCallsQuery {
    #[serde(default)]
    pub campaign_id: Option<Uuid>,
    #[serde(default)]
    pub contact_id: Option<Uuid>,
    #[serde(default = "d_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn d_limit() -> usize {
    50
}

/// `GET /api/calls`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListCallsQuery>,
) -> Json<Value> {
    let limit = query.limit.min(500);
    let calls = state
        .calls
        .list(query.campaign_id, query.contact_id, limit, query.offset);
    let count = calls.len();
    Json(json!({ "success": true, "calls": calls, "count": count }))
}

/// `GET /api/calls/:sid`
pub async fn get(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<Json<Value>> {
    let call = state
        .calls
        .get(&sid)
        .ok_or_else(|| ApiError::not_found(format!("call {sid}")))?;
    Ok(Json(json!({
        "success": true,
        "call": call,
        "bridge": state.bridge.registry.get(&sid),
    })))
}

/// `GET /api/calls/:sid/events`
pub async fn events(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<Json<Value>> {
    let events = state
        .calls
        .events(&sid)
        .ok_or_else(|| ApiError::not_found(format!("call {sid}")))?;
    let count = events.len();
    Ok(Json(json!({ "success": true, "events": events, "count": count })))
}

/// `GET /api/calls/:sid/transcript`
pub async fn transcript(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<Json<Value>> {
    let transcript = state
        .calls
        .transcript(&sid)
        .ok_or_else(|| ApiError::not_found(format!("call {sid}")))?;
    Ok(Json(json!({ "success": true, "transcript": transcript })))
}

/// `POST /api/calls/:sid/terminate` — admin hang-up. Attribution is
/// `api_request`, which dominates natural signals racing in behind it.
pub async fn terminate(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<Json<Value>> {
    if state.calls.get(&sid).is_none() {
        return Err(ApiError::not_found(format!("call {sid}")));
    }

    // Cancel the bridge session first so audio stops immediately.
    state.bridge.registry.terminate(&sid);
    state
        .gateway
        .terminate_call(&sid, EventSource::Internal, TerminatedBy::ApiRequest)
        .await?;

    Ok(Json(json!({ "success": true, "callId": sid })))
}
