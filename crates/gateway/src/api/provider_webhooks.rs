//! Telephony-provider webhooks (form-encoded).
//!
//! Every handler answers 200 no matter what happened internally: a
//! non-200 would make the provider retry and eventually disable the
//! webhook. Failures are logged and recorded as error call events.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use vox_domain::model::{
    AnsweredBy, Call, CallEvent, CallEventType, CallState, EventSource, TerminatedBy,
};

use crate::state::AppState;
use crate::telephony::twiml;

fn ok() -> Response {
    (StatusCode::OK, "Webhook received").into_response()
}

fn record_failure(state: &AppState, sid: &str, stage: &str, error: &str) {
    tracing::error!(call_sid = %sid, stage, error, "webhook processing failed");
    let _ = state.calls.append_event(CallEvent::now(
        sid,
        CallEventType::Error,
        EventSource::Internal,
        json!({ "stage": stage, "error": error }),
    ));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /call-status-callback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct StatusCallbackForm {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: String,
    #[serde(rename = "From", default)]
    pub from: Option<String>,
    #[serde(rename = "To", default)]
    pub to: Option<String>,
    #[serde(rename = "CallDuration", default)]
    pub call_duration: Option<String>,
    #[serde(rename = "AnsweredBy", default)]
    pub answered_by: Option<String>,
}

pub async fn status_callback(
    State(state): State<AppState>,
    Form(form): Form<StatusCallbackForm>,
) -> Response {
    let sid = form.call_sid.clone();
    let Some(next) = CallState::from_provider(&form.call_status) else {
        tracing::warn!(call_sid = %sid, status = %form.call_status, "unknown provider status");
        return ok();
    };

    // Single calls dialed outside this process still get a row so the
    // event log has somewhere to live.
    if state.calls.get(&sid).is_none() {
        state.calls.upsert_call(Call::outbound(
            sid.clone(),
            form.from.clone().unwrap_or_default(),
            form.to.clone().unwrap_or_default(),
        ));
    }

    let duration = form.call_duration.as_deref().and_then(|d| d.parse().ok());
    let answered_by = form.answered_by.as_deref().map(AnsweredBy::from_provider);

    let updated = state.calls.update_call(&sid, |call| {
        let changed = call.apply_transition(next, Utc::now());
        if let Some(secs) = duration {
            call.duration_secs = Some(secs);
        }
        if let Some(by) = answered_by {
            call.answered_by.get_or_insert(by);
        }
        (changed, call.clone())
    });

    let Some((changed, call)) = updated else {
        record_failure(&state, &sid, "status_callback", "call row vanished");
        return ok();
    };

    if let Err(e) = state.calls.append_event(CallEvent::now(
        &sid,
        CallEventType::StatusChange,
        EventSource::Telephony,
        json!({ "status": form.call_status, "duration": duration }),
    )) {
        record_failure(&state, &sid, "status_callback", &e.to_string());
    }

    // Attribution runs before the terminal event goes out, so the
    // outcome handler settles the contact and the campaign counters
    // from an already-attributed call.
    if next.is_terminal() {
        state.arbiter.signal_provider_terminal(&sid, next);
        state.arbiter.finalize(&sid);
    }
    if changed {
        let call = state.calls.get(&sid).unwrap_or(call);
        state.bus.publish_call(&call);
    }
    ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /amd-status-callback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct AmdCallbackForm {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "AnsweredBy")]
    pub answered_by: String,
    #[serde(rename = "MachineBehavior", default)]
    pub machine_behavior: Option<String>,
}

pub async fn amd_callback(
    State(state): State<AppState>,
    Form(form): Form<AmdCallbackForm>,
) -> Response {
    let sid = form.call_sid.clone();
    let answered_by = AnsweredBy::from_provider(&form.answered_by);

    let updated = state.calls.update_call(&sid, |call| {
        call.answered_by = Some(answered_by);
        call.clone()
    });
    let Some(call) = updated else {
        tracing::warn!(call_sid = %sid, "amd callback for unknown call");
        return ok();
    };

    let _ = state.calls.append_event(CallEvent::now(
        &sid,
        CallEventType::MachineDetection,
        EventSource::Telephony,
        json!({
            "answeredBy": form.answered_by,
            "machineBehavior": form.machine_behavior,
        }),
    ));
    state.bus.publish_call(&call);

    if answered_by.is_machine() {
        tracing::info!(call_sid = %sid, ?answered_by, "machine detected, hanging up");
        // Teardown is network work; the webhook must answer fast.
        let state = state.clone();
        tokio::spawn(async move {
            state.bridge.registry.terminate(&sid);
            if let Err(e) = state
                .gateway
                .terminate_call(&sid, EventSource::Telephony, TerminatedBy::AmdMachine)
                .await
            {
                record_failure(&state, &sid, "amd_hangup", &e.to_string());
            }
        });
    }
    ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /recording-status-callback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct RecordingCallbackForm {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "RecordingSid")]
    pub recording_sid: String,
    #[serde(rename = "RecordingUrl", default)]
    pub recording_url: Option<String>,
    #[serde(rename = "RecordingStatus")]
    pub recording_status: String,
    #[serde(rename = "RecordingDuration", default)]
    pub recording_duration: Option<String>,
    #[serde(rename = "RecordingChannels", default)]
    pub recording_channels: Option<String>,
}

pub async fn recording_callback(
    State(state): State<AppState>,
    Form(form): Form<RecordingCallbackForm>,
) -> Response {
    use vox_domain::model::{Recording, RecordingStatus};

    let status = match form.recording_status.as_str() {
        "in-progress" => RecordingStatus::InProgress,
        "completed" => RecordingStatus::Completed,
        "failed" | "absent" => RecordingStatus::Failed,
        _ => RecordingStatus::Pending,
    };
    let recording = Recording {
        sid: form.recording_sid.clone(),
        call_sid: form.call_sid.clone(),
        status,
        url: form.recording_url,
        duration_secs: form.recording_duration.as_deref().and_then(|d| d.parse().ok()),
        channels: form.recording_channels.as_deref().and_then(|c| c.parse().ok()),
        updated_at: Utc::now(),
    };

    state.calls.upsert_recording(recording.clone());
    let _ = state.calls.append_event(CallEvent::now(
        &form.call_sid,
        CallEventType::RecordingUpdate,
        EventSource::Telephony,
        json!({ "recordingSid": form.recording_sid, "status": form.recording_status }),
    ));
    state.bus.publish(
        &vox_domain::events::topics::call(&form.call_sid),
        vox_domain::events::DomainEvent::RecordingUpdated { recording },
    );
    ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /quality-insights-callback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn quality_callback(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let Some(sid) = form.get("CallSid").cloned() else {
        tracing::warn!("quality callback without CallSid");
        return ok();
    };
    let payload = json!(form);

    let _ = state.calls.append_event(CallEvent::now(
        &sid,
        CallEventType::QualityUpdate,
        EventSource::Telephony,
        payload.clone(),
    ));
    state.bus.publish(
        &vox_domain::events::topics::call(&sid),
        vox_domain::events::DomainEvent::QualityUpdate {
            call_sid: sid.clone(),
            payload: payload.clone(),
        },
    );

    // Optional insights-based attribution, when a classifier is wired.
    if let (Some(classifier), Some(call)) =
        (state.arbiter.insights.as_ref(), state.calls.get(&sid))
    {
        if let Some(tag) = classifier.classify(&call, &payload) {
            state.arbiter.signal(&sid, EventSource::Telephony, tag);
        }
    }
    ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /fallback-twiml
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn fallback_twiml() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml")],
        twiml::fallback_apology(),
    )
        .into_response()
}
