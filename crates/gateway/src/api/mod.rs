//! HTTP surface.
//!
//! Routes split into **public** (provider webhooks, media stream,
//! real-time hub, health) and **protected** (`/api/*`, behind the
//! bearer-key middleware when `API_KEY` is configured).

pub mod ai_webhook;
pub mod auth;
pub mod calls;
pub mod campaigns;
pub mod contacts;
pub mod outbound;
pub mod provider_webhooks;
pub mod recordings;
pub mod respond;

use axum::extract::State;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use crate::state::AppState;

async fn health(State(state): State<AppState>) -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "activeCalls": state.calls.active_calls().len(),
        "bridgeSessions": state.bridge.registry.list().len(),
    }))
}

/// Build the full router. `state` is needed up front to wire the auth
/// middleware.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/healthz", get(health))
        // Provider webhooks (form-encoded, always 200)
        .route("/call-status-callback", post(provider_webhooks::status_callback))
        .route("/amd-status-callback", post(provider_webhooks::amd_callback))
        .route(
            "/recording-status-callback",
            post(provider_webhooks::recording_callback),
        )
        .route(
            "/quality-insights-callback",
            post(provider_webhooks::quality_callback),
        )
        .route("/fallback-twiml", post(provider_webhooks::fallback_twiml))
        // AI post-call webhook (HMAC-verified)
        .route("/webhooks/elevenlabs", post(ai_webhook::post_call))
        // Media stream + dashboard sockets
        .route("/outbound-media-stream", get(crate::bridge::media_stream_ws))
        .route("/socket.io/", get(crate::hub::ws::hub_ws));

    let protected = Router::new()
        .route("/api/outbound-call", post(outbound::create))
        // Campaigns
        .route(
            "/api/campaigns",
            post(campaigns::create).get(campaigns::list),
        )
        .route("/api/campaigns/start-from-csv", post(contacts::start_from_csv))
        .route(
            "/api/campaigns/:id",
            get(campaigns::get)
                .put(campaigns::update)
                .delete(campaigns::remove),
        )
        .route("/api/campaigns/:id/start", post(campaigns::start))
        .route("/api/campaigns/:id/pause", post(campaigns::pause))
        .route("/api/campaigns/:id/resume", post(campaigns::resume))
        .route("/api/campaigns/:id/stop", post(campaigns::stop))
        .route("/api/campaigns/:id/contacts", post(contacts::add_to_campaign))
        // Calls
        .route("/api/calls", get(calls::list))
        .route("/api/calls/:sid", get(calls::get))
        .route("/api/calls/:sid/events", get(calls::events))
        .route("/api/calls/:sid/transcript", get(calls::transcript))
        .route("/api/calls/:sid/terminate", post(calls::terminate))
        // Recordings
        .route("/api/recordings/:sid", get(recordings::get))
        .route("/api/media/recordings/:sid", get(recordings::media))
        .layer(middleware::from_fn_with_state(
            state,
            auth::require_api_key,
        ));

    public.merge(protected)
}
