//! `POST /api/outbound-call` — dial a single number outside any
//! campaign (or on behalf of one, when ids are supplied).

use axum::extract::State;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::contacts::validate_phone;
use crate::api::respond::ApiResult;
use crate::state::AppState;
use crate::telephony::OutboundCallRequest;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundCallBody {
    pub to: String,
    #[serde(default)]
    pub from: Option<String>,
    /// Accepted for forward compatibility with number pools; unused.
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub first_message: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<Uuid>,
    #[serde(default)]
    pub contact_id: Option<Uuid>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<OutboundCallBody>,
) -> ApiResult<Json<Value>> {
    validate_phone(&body.to)?;

    let req = OutboundCallRequest {
        to: body.to,
        from: body.from,
        prompt: body.prompt,
        first_message: body.first_message,
        name: body.name,
        campaign_id: body.campaign_id,
        contact_id: body.contact_id,
    };
    let call_sid = state.gateway.start_call(&req).await?;

    Ok(Json(json!({ "success": true, "callId": call_sid })))
}
