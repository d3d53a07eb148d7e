//! Recording metadata and audio proxying. The audio endpoint streams
//! straight from the provider with basic auth attached; caching is the
//! dashboard CDN's problem, not ours.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::api::respond::{ApiError, ApiResult};
use crate::state::AppState;

/// `GET /api/recordings/:sid`
pub async fn get(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let recording = state
        .calls
        .recording(&sid)
        .ok_or_else(|| ApiError::not_found(format!("recording {sid}")))?;
    Ok(Json(json!({ "success": true, "recording": recording })))
}

/// `GET /api/media/recordings/:sid` — streamed audio.
pub async fn media(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> ApiResult<Response> {
    let recording = state
        .calls
        .recording(&sid)
        .ok_or_else(|| ApiError::not_found(format!("recording {sid}")))?;
    let url = recording
        .url
        .ok_or_else(|| ApiError::not_found(format!("recording {sid} has no media yet")))?;

    let upstream = state
        .http
        .get(format!("{url}.mp3"))
        .basic_auth(
            &state.config.telephony.account_sid,
            Some(&state.config.telephony.auth_token),
        )
        .send()
        .await
        .map_err(|e| vox_domain::Error::Transient(format!("recording fetch: {e}")))?;

    if !upstream.status().is_success() {
        return Err(ApiError::new(
            axum::http::StatusCode::BAD_GATEWAY,
            "provider_failure",
            format!("provider returned {}", upstream.status()),
        ));
    }

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("audio/mpeg")
        .to_string();

    let body = Body::from_stream(upstream.bytes_stream());
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{sid}.mp3\""),
            ),
        ],
        body,
    )
        .into_response())
}
