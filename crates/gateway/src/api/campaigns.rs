//! Campaign CRUD + lifecycle API.

use axum::extract::{Path, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use vox_domain::model::{Campaign, CampaignSettings, CampaignState};

use crate::api::respond::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCampaignBody {
    pub name: String,
    #[serde(default)]
    pub settings: Option<CampaignSettings>,
}

/// `POST /api/campaigns`
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateCampaignBody>,
) -> ApiResult<Json<Value>> {
    if body.name.trim().is_empty() {
        return Err(ApiError::validation(
            "campaign name must not be empty",
            vec!["name".into()],
        ));
    }
    let settings = body.settings.unwrap_or_default();
    if settings.max_concurrent_calls == 0 {
        return Err(ApiError::validation(
            "maxConcurrentCalls must be at least 1",
            vec!["settings.maxConcurrentCalls".into()],
        ));
    }

    let campaign = Campaign::new(body.name.trim(), settings);
    let campaign = state.campaigns.insert(campaign).await;
    Ok(Json(json!({ "success": true, "campaign": campaign })))
}

/// `GET /api/campaigns`
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let campaigns = state.campaigns.list();
    let count = campaigns.len();
    Json(json!({ "success": true, "campaigns": campaigns, "count": count }))
}

/// `GET /api/campaigns/:id`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let campaign = state
        .campaigns
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("campaign {id}")))?;
    Ok(Json(json!({
        "success": true,
        "campaign": campaign,
        "pendingContacts": state.contacts.pending_count(&id),
        "inFlight": state.engine.in_flight_count(&id),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCampaignBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub settings: Option<CampaignSettings>,
}

/// `PUT /api/campaigns/:id`. Settings edits take effect on the next
/// start/resume; the engine works from a snapshot.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateCampaignBody>,
) -> ApiResult<Json<Value>> {
    let campaign = state
        .campaigns
        .update(&id, |c| {
            if let Some(name) = &body.name {
                if !name.trim().is_empty() {
                    c.name = name.trim().to_string();
                }
            }
            if let Some(settings) = &body.settings {
                c.settings = settings.clone();
            }
        })
        .await
        .ok_or_else(|| ApiError::not_found(format!("campaign {id}")))?;
    state.engine.publish_campaign(&campaign);
    Ok(Json(json!({ "success": true, "campaign": campaign })))
}

/// `DELETE /api/campaigns/:id`
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    if state.engine.is_active(&id) {
        return Err(ApiError::new(
            axum::http::StatusCode::CONFLICT,
            "conflict",
            "stop the campaign before deleting it",
        ));
    }
    if !state.campaigns.delete(&id).await {
        return Err(ApiError::not_found(format!("campaign {id}")));
    }
    Ok(Json(json!({ "success": true })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `POST /api/campaigns/:id/start`
pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let campaign = state.engine.start(&id).await?;
    Ok(Json(json!({ "success": true, "campaign": campaign })))
}

/// `POST /api/campaigns/:id/pause`
pub async fn pause(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    if !state.engine.pause(&id).await {
        return Err(ApiError::new(
            axum::http::StatusCode::CONFLICT,
            "conflict",
            format!("campaign {id} is not active"),
        ));
    }
    Ok(Json(json!({ "success": true, "state": CampaignState::Paused })))
}

/// `POST /api/campaigns/:id/resume`
pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let campaign = state.engine.resume(&id).await?;
    Ok(Json(json!({ "success": true, "campaign": campaign })))
}

/// `POST /api/campaigns/:id/stop`
pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    if !state.engine.stop(&id).await {
        return Err(ApiError::new(
            axum::http::StatusCode::CONFLICT,
            "conflict",
            format!("campaign {id} is neither active nor paused"),
        ));
    }
    Ok(Json(json!({ "success": true, "state": CampaignState::Cancelled })))
}
