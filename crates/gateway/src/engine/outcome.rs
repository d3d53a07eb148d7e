//! Outcome handler — settles calls for campaign bookkeeping as they
//! reach terminal states.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use vox_domain::events::{topics, DomainEvent};
use vox_domain::model::{Call, CallState, ContactOutcome};

use super::runtime::complete_campaign;
use super::CampaignEngine;

pub(crate) fn spawn_outcome_handler(engine: Arc<CampaignEngine>) {
    tokio::spawn(async move {
        let mut rx = engine.bus.subscribe(topics::CALL_UPDATES);
        loop {
            match rx.recv().await {
                Ok(DomainEvent::CallUpdated { call }) if call.is_terminal() => {
                    handle_terminal(&engine, call).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "outcome handler lagged on call.updates");
                    engine.note_bus_lag();
                }
                Err(RecvError::Closed) => break,
            }
            if engine.is_shutting_down() {
                break;
            }
        }
    });
}

/// Map a settled call to its contact disposition. Only `agent`, `user`
/// and `amd_machine` attributions count as `called`; provider-side
/// failures and every other termination (duration cap, inactivity, API
/// terminate, short-hangup heuristic, unknown) count as `failed`.
fn contact_outcome(call: &Call) -> ContactOutcome {
    match call.state {
        CallState::Busy | CallState::NoAnswer | CallState::Failed | CallState::Canceled => {
            ContactOutcome::Failed
        }
        _ => {
            if call.terminated_by.is_some_and(|t| t.counts_as_called()) {
                ContactOutcome::Called
            } else {
                ContactOutcome::Failed
            }
        }
    }
}

async fn handle_terminal(engine: &CampaignEngine, call: Call) {
    let Some(campaign_id) = call.campaign_id else {
        return;
    };

    // A terminal call can publish several updates (state transition,
    // attribution write). Only the removal from the in-flight set (in
    // the active runtime or the paused snapshot) settles it.
    let contact_id = take_in_flight(engine, &campaign_id, &call.sid);
    let Some(contact_id) = contact_id else {
        return;
    };

    let outcome = contact_outcome(&call);
    engine.contacts.finalize(&contact_id, outcome).await;

    let answered = call.answered_at.is_some();
    let duration = call.duration_secs.unwrap_or_else(|| {
        match (call.answered_at, call.ended_at) {
            (Some(a), Some(e)) => (e - a).num_seconds().max(0) as u64,
            _ => 0,
        }
    });

    // The campaign counters follow the same classification as the
    // contact; a call must never be `failed` on one ledger and
    // `completed` on the other.
    if let Some(campaign) = engine
        .campaigns
        .update(&campaign_id, |c| {
            if answered {
                c.stats.calls_answered += 1;
            }
            match outcome {
                ContactOutcome::Called => c.stats.record_completed(duration),
                ContactOutcome::Failed => c.stats.calls_failed += 1,
            }
        })
        .await
    {
        engine.publish_campaign(&campaign);
    }

    tracing::info!(
        campaign_id = %campaign_id,
        call_sid = %call.sid,
        state = ?call.state,
        terminated_by = ?call.terminated_by,
        ?outcome,
        "campaign call settled"
    );

    // Campaign completion: nothing pending, nothing in flight.
    if engine.is_active(&campaign_id)
        && engine.in_flight_count(&campaign_id) == 0
        && engine.contacts.pending_count(&campaign_id) == 0
    {
        complete_campaign(engine, &campaign_id).await;
    }
}

fn take_in_flight(engine: &CampaignEngine, campaign_id: &Uuid, sid: &str) -> Option<Uuid> {
    if let Some(rt) = engine.runtime(campaign_id) {
        if let Some(contact) = rt.in_flight.lock().remove(sid) {
            return Some(contact);
        }
    }
    if let Some(paused) = engine.paused_snapshot(campaign_id) {
        if let Some(contact) = paused.in_flight.lock().remove(sid) {
            return Some(contact);
        }
    }
    None
}
