//! Fire-and-forget CRM webhook dispatch.
//!
//! When enabled, call completion posts a compact outcome document to
//! the configured CRM endpoint. Failures are logged and never retried;
//! the CRM side is expected to reconcile from the API if it misses one.

use serde_json::json;

use vox_domain::model::{Call, CallEvent, CallEventType, EventSource};

use crate::state::AppState;

pub fn dispatch(state: &AppState, call: &Call, summary: Option<&str>) {
    if !state.config.crm.enabled {
        return;
    }
    let Some(url) = state.config.crm.webhook_url.clone() else {
        return;
    };

    let payload = json!({
        "callSid": call.sid,
        "to": call.to,
        "campaignId": call.campaign_id,
        "contactId": call.contact_id,
        "state": call.state,
        "terminatedBy": call.terminated_by,
        "durationSecs": call.duration_secs,
        "summary": summary,
    });

    let _ = state.calls.append_event(CallEvent::now(
        &call.sid,
        CallEventType::CrmSend,
        EventSource::Internal,
        payload.clone(),
    ));

    let http = state.http.clone();
    let sid = call.sid.clone();
    tokio::spawn(async move {
        match http.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(call_sid = %sid, "crm webhook delivered");
            }
            Ok(resp) => {
                tracing::warn!(call_sid = %sid, status = %resp.status(), "crm webhook rejected");
            }
            Err(e) => {
                tracing::warn!(call_sid = %sid, error = %e, "crm webhook failed");
            }
        }
    });
}
