//! Per-campaign runtime handle, ticker task and cycle logic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vox_domain::events::DomainEvent;
use vox_domain::model::{CallSid, CampaignSettings, CampaignState, ContactOutcome};

use super::CampaignEngine;
use crate::telephony::OutboundCallRequest;

/// Consecutive `insufficient_funds` rejections inside this window
/// auto-pause the campaign.
const FUNDS_FAILURE_THRESHOLD: usize = 3;
const FUNDS_FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Runtime handle for one active campaign.
pub struct CampaignRuntime {
    pub id: Uuid,
    /// Settings snapshot taken when the campaign (re)started.
    pub settings: CampaignSettings,
    pub cancel: CancellationToken,
    /// Provider call sid → contact id for every in-flight dial.
    /// Shared with the paused snapshot so outcomes land either way.
    pub in_flight: Arc<Mutex<HashMap<CallSid, Uuid>>>,
    /// Single-holder latch serializing cycles within the campaign.
    cycle_in_progress: AtomicBool,
    funds_failures: Mutex<VecDeque<Instant>>,
}

/// What survives a pause: the settings snapshot and the still-running
/// dial attempts.
#[derive(Clone)]
pub struct PausedCampaign {
    pub settings: CampaignSettings,
    pub in_flight: Arc<Mutex<HashMap<CallSid, Uuid>>>,
}

impl CampaignRuntime {
    pub fn new(id: Uuid, settings: CampaignSettings) -> Arc<Self> {
        Arc::new(Self {
            id,
            settings,
            cancel: CancellationToken::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            cycle_in_progress: AtomicBool::new(false),
            funds_failures: Mutex::new(VecDeque::new()),
        })
    }

    /// Rebuild from a pause snapshot, keeping the in-flight set.
    pub fn resume(id: Uuid, settings: CampaignSettings, snapshot: PausedCampaign) -> Arc<Self> {
        Arc::new(Self {
            id,
            settings,
            cancel: CancellationToken::new(),
            in_flight: snapshot.in_flight,
            cycle_in_progress: AtomicBool::new(false),
            funds_failures: Mutex::new(VecDeque::new()),
        })
    }

    pub fn snapshot(&self) -> PausedCampaign {
        PausedCampaign {
            settings: self.settings.clone(),
            in_flight: self.in_flight.clone(),
        }
    }

    /// Record one funds rejection; true once the threshold is crossed.
    fn note_funds_failure(&self) -> bool {
        let mut window = self.funds_failures.lock();
        let now = Instant::now();
        window.push_back(now);
        while window
            .front()
            .map_or(false, |t| now.duration_since(*t) > FUNDS_FAILURE_WINDOW)
        {
            window.pop_front();
        }
        window.len() >= FUNDS_FAILURE_THRESHOLD
    }
}

/// Ticker: one independent timer per active campaign. The first tick
/// runs immediately on start/resume; recovery delays it one cadence so
/// the webhook backlog drains first.
pub(crate) fn spawn_ticker(
    engine: Arc<CampaignEngine>,
    rt: Arc<CampaignRuntime>,
    delay_first_tick: bool,
) {
    tokio::spawn(async move {
        if delay_first_tick {
            let delay = engine.effective_delay(rt.settings.call_delay_ms);
            tokio::select! {
                _ = rt.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        loop {
            if rt.cancel.is_cancelled() || engine.is_shutting_down() {
                return;
            }
            run_cycle(&engine, &rt).await;
            let delay = engine.effective_delay(rt.settings.call_delay_ms);
            tokio::select! {
                _ = rt.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    });
}

/// One tick. The latch makes overlapping executions impossible even
/// when a cycle outlives the tick period.
pub(crate) async fn run_cycle(engine: &CampaignEngine, rt: &CampaignRuntime) {
    if rt.cycle_in_progress.swap(true, Ordering::AcqRel) {
        tracing::debug!(campaign_id = %rt.id, "cycle still in progress, skipping tick");
        return;
    }
    cycle(engine, rt).await;
    rt.cycle_in_progress.store(false, Ordering::Release);
}

async fn cycle(engine: &CampaignEngine, rt: &CampaignRuntime) {
    let in_flight_len = rt.in_flight.lock().len();
    let slots = rt.settings.max_concurrent_calls.saturating_sub(in_flight_len);
    if slots == 0 {
        return;
    }

    let lock_ttl = chrono::Duration::seconds(engine.defaults.lock_ttl_secs as i64);
    let claimed = engine.contacts.claim_next(&rt.id, slots, lock_ttl).await;

    if claimed.is_empty() {
        if in_flight_len == 0 && engine.contacts.pending_count(&rt.id) == 0 {
            complete_campaign(engine, &rt.id).await;
        }
        return;
    }

    let mut placed = 0u64;
    let mut failed = 0u64;
    let mut auto_pause = false;

    for contact in claimed {
        // A pause or shutdown mid-cycle stops dialing immediately; the
        // sweeper re-pends anything claimed but never dialed.
        if rt.cancel.is_cancelled() || engine.is_shutting_down() {
            break;
        }

        let req = OutboundCallRequest {
            to: contact.phone.clone(),
            from: rt.settings.caller_id.clone(),
            prompt: rt.settings.dialer_prompt.clone(),
            first_message: rt.settings.first_message.clone(),
            name: Some(contact.name.clone()),
            campaign_id: Some(rt.id),
            contact_id: Some(contact.id),
        };

        placed += 1;
        match engine.gateway.start_call(&req).await {
            Ok(sid) => {
                rt.in_flight.lock().insert(sid, contact.id);
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(
                    campaign_id = %rt.id,
                    contact_id = %contact.id,
                    error = %e,
                    "create call failed"
                );
                engine
                    .contacts
                    .finalize(&contact.id, ContactOutcome::Failed)
                    .await;

                if e.provider_reason() == Some("insufficient_funds")
                    && rt.note_funds_failure()
                {
                    auto_pause = true;
                    break;
                }
            }
        }
    }

    if placed > 0 {
        if let Some(campaign) = engine
            .campaigns
            .update(&rt.id, |c| {
                c.stats.calls_placed += placed;
                c.stats.calls_failed += failed;
            })
            .await
        {
            engine.publish_campaign(&campaign);
            engine.bus.publish(
                &vox_domain::events::topics::campaign(&rt.id),
                DomainEvent::CampaignProgress {
                    campaign_id: rt.id,
                    calls_placed: campaign.stats.calls_placed,
                    calls_completed: campaign.stats.calls_completed,
                    calls_failed: campaign.stats.calls_failed,
                    in_flight: rt.in_flight.lock().len(),
                },
            );
        }
    }

    if auto_pause {
        tracing::error!(
            campaign_id = %rt.id,
            "repeated insufficient_funds rejections, auto-pausing campaign"
        );
        engine.pause(&rt.id).await;
    }
}

/// All contacts settled and nothing in flight: the campaign is done.
pub(crate) async fn complete_campaign(engine: &CampaignEngine, id: &Uuid) {
    engine.remove_runtime(id);
    if let Some(campaign) = engine
        .campaigns
        .update(id, |c| {
            if c.state == CampaignState::Active {
                c.state = CampaignState::Completed;
            }
        })
        .await
    {
        engine.publish_campaign(&campaign);
        tracing::info!(campaign_id = %id, "campaign completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funds_failures_trip_only_inside_window() {
        let rt = CampaignRuntime::new(Uuid::new_v4(), CampaignSettings::default());
        assert!(!rt.note_funds_failure());
        assert!(!rt.note_funds_failure());
        assert!(rt.note_funds_failure(), "third failure crosses the threshold");
    }

    #[test]
    fn cycle_latch_is_single_holder() {
        let rt = CampaignRuntime::new(Uuid::new_v4(), CampaignSettings::default());
        assert!(!rt.cycle_in_progress.swap(true, Ordering::AcqRel));
        // A second tick arriving while the first runs sees the latch.
        assert!(rt.cycle_in_progress.swap(true, Ordering::AcqRel));
        rt.cycle_in_progress.store(false, Ordering::Release);
        assert!(!rt.cycle_in_progress.swap(true, Ordering::AcqRel));
    }

    #[test]
    fn pause_snapshot_shares_the_in_flight_set() {
        let rt = CampaignRuntime::new(Uuid::new_v4(), CampaignSettings::default());
        rt.in_flight.lock().insert("CA1".into(), Uuid::new_v4());

        let snapshot = rt.snapshot();
        // An outcome landing while paused settles through the snapshot.
        snapshot.in_flight.lock().remove("CA1");
        assert!(rt.in_flight.lock().is_empty());

        let resumed = CampaignRuntime::resume(rt.id, rt.settings.clone(), snapshot);
        assert!(resumed.in_flight.lock().is_empty());
        assert!(!resumed.cancel.is_cancelled());
    }
}
