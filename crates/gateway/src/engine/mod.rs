//! Campaign engine — drives outbound dialing for active campaigns.
//!
//! Each active campaign owns a ticker task. A tick claims contacts
//! (atomic, store-level), dials them through the call gateway, and
//! tracks the in-flight set; the outcome subscriber settles calls as
//! they reach terminal states. Pause/resume/stop move campaigns between
//! the `active` and `paused` maps without ever waiting on in-flight
//! calls.

mod outcome;
mod runtime;

pub use runtime::{CampaignRuntime, PausedCampaign};

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vox_domain::config::EngineConfig;
use vox_domain::events::{topics, DomainEvent};
use vox_domain::model::{Campaign, CampaignState};
use vox_domain::{Error, Result};
use vox_store::{CampaignStore, ContactStore};

use crate::bus::EventBus;
use crate::telephony::CallGateway;

/// How long a bus-lag observation keeps the dial rate halved.
const LAG_HOLD: Duration = Duration::from_secs(10);

pub struct CampaignEngine {
    pub(crate) campaigns: Arc<CampaignStore>,
    pub(crate) contacts: Arc<ContactStore>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) gateway: Arc<CallGateway>,
    pub(crate) defaults: EngineConfig,

    active: Mutex<HashMap<Uuid, Arc<CampaignRuntime>>>,
    paused: Mutex<HashMap<Uuid, PausedCampaign>>,
    /// Epoch millis until which the dial rate stays halved; 0 = clear.
    lag_until_ms: AtomicI64,
    shutdown: CancellationToken,
    /// Back-reference handed to spawned ticker tasks.
    self_ref: Weak<CampaignEngine>,
}

impl CampaignEngine {
    pub fn new(
        campaigns: Arc<CampaignStore>,
        contacts: Arc<ContactStore>,
        bus: Arc<EventBus>,
        gateway: Arc<CallGateway>,
        defaults: EngineConfig,
    ) -> Arc<Self> {
        let engine = Arc::new_cyclic(|weak| Self {
            campaigns,
            contacts,
            bus,
            gateway,
            defaults,
            active: Mutex::new(HashMap::new()),
            paused: Mutex::new(HashMap::new()),
            lag_until_ms: AtomicI64::new(0),
            shutdown: CancellationToken::new(),
            self_ref: weak.clone(),
        });
        outcome::spawn_outcome_handler(engine.clone());
        engine
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start a campaign. Draft (or completed, for a re-run) campaigns only;
    /// starting an already-active one is a conflict.
    pub async fn start(&self, id: &Uuid) -> Result<Campaign> {
        if self.active.lock().contains_key(id) {
            return Err(Error::Conflict(format!("campaign {id} is already active")));
        }
        self.paused.lock().remove(id);

        let campaign = self
            .campaigns
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("campaign {id}")))?;
        if campaign.state == CampaignState::Active {
            return Err(Error::Conflict(format!("campaign {id} is already active")));
        }

        let updated = self
            .campaigns
            .update(id, |c| c.state = CampaignState::Active)
            .await
            .ok_or_else(|| Error::NotFound(format!("campaign {id}")))?;

        let rt = CampaignRuntime::new(*id, updated.settings.clone());
        self.install(rt, false);
        self.publish_campaign(&updated);
        tracing::info!(campaign_id = %id, "campaign started");
        Ok(updated)
    }

    /// Pause: stop the ticker, remove the runtime handle, snapshot into
    /// `paused`, persist the state. Never waits for in-flight calls.
    pub async fn pause(&self, id: &Uuid) -> bool {
        let rt = match self.active.lock().remove(id) {
            Some(rt) => rt,
            None => return false,
        };
        // Cancelled before the handle drops out of scope: no further
        // tick can start, and a mid-cycle tick stops dialing.
        rt.cancel.cancel();

        self.paused.lock().insert(*id, rt.snapshot());

        if let Some(campaign) = self
            .campaigns
            .update(id, |c| c.state = CampaignState::Paused)
            .await
        {
            self.publish_campaign(&campaign);
        }
        tracing::info!(campaign_id = %id, "campaign paused");
        true
    }

    /// Resume: mirror of pause, plus an immediate first tick.
    pub async fn resume(&self, id: &Uuid) -> Result<Campaign> {
        let snapshot = self
            .paused
            .lock()
            .remove(id)
            .ok_or_else(|| Error::Conflict(format!("campaign {id} is not paused")))?;

        let campaign = self
            .campaigns
            .update(id, |c| c.state = CampaignState::Active)
            .await
            .ok_or_else(|| Error::NotFound(format!("campaign {id}")))?;

        let rt = CampaignRuntime::resume(*id, campaign.settings.clone(), snapshot);
        self.install(rt, false);
        self.publish_campaign(&campaign);
        tracing::info!(campaign_id = %id, "campaign resumed");
        Ok(campaign)
    }

    /// Stop: pause semantics, state `cancelled`, snapshot discarded.
    pub async fn stop(&self, id: &Uuid) -> bool {
        let was_active = match self.active.lock().remove(id) {
            Some(rt) => {
                rt.cancel.cancel();
                true
            }
            None => false,
        };
        let was_paused = self.paused.lock().remove(id).is_some();
        if !was_active && !was_paused {
            return false;
        }

        if let Some(campaign) = self
            .campaigns
            .update(id, |c| c.state = CampaignState::Cancelled)
            .await
        {
            self.publish_campaign(&campaign);
        }
        tracing::info!(campaign_id = %id, "campaign stopped");
        true
    }

    /// Rebuild runtime handles for campaigns that were active when the
    /// process last exited. The first tick is delayed one cadence so the
    /// provider's webhook backlog drains first.
    pub fn recover(&self) {
        for campaign in self.campaigns.list_in_state(CampaignState::Active) {
            tracing::info!(campaign_id = %campaign.id, "recovering active campaign");
            let rt = CampaignRuntime::new(campaign.id, campaign.settings.clone());
            self.install(rt, true);
        }
    }

    /// Stop every ticker; in-flight cycles finish their current step.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for rt in self.active.lock().values() {
            rt.cancel.cancel();
        }
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn is_active(&self, id: &Uuid) -> bool {
        self.active.lock().contains_key(id)
    }

    pub fn is_paused(&self, id: &Uuid) -> bool {
        self.paused.lock().contains_key(id)
    }

    pub fn in_flight_count(&self, id: &Uuid) -> usize {
        if let Some(rt) = self.active.lock().get(id) {
            return rt.in_flight.lock().len();
        }
        self.paused
            .lock()
            .get(id)
            .map(|p| p.in_flight.lock().len())
            .unwrap_or(0)
    }

    /// Whether any runtime (active or paused) still tracks a dial
    /// attempt for this contact. Feeds the lock sweeper.
    pub fn contact_in_flight(&self, contact_id: &Uuid) -> bool {
        let check = |map: &HashMap<String, Uuid>| map.values().any(|c| c == contact_id);
        if self
            .active
            .lock()
            .values()
            .any(|rt| check(&rt.in_flight.lock()))
        {
            return true;
        }
        self.paused
            .lock()
            .values()
            .any(|p| check(&p.in_flight.lock()))
    }

    // ── Internals ────────────────────────────────────────────────────

    fn install(&self, rt: Arc<CampaignRuntime>, delay_first_tick: bool) {
        let Some(engine) = self.self_ref.upgrade() else {
            return;
        };
        self.active.lock().insert(rt.id, rt.clone());
        runtime::spawn_ticker(engine, rt, delay_first_tick);
    }

    pub(crate) fn remove_runtime(&self, id: &Uuid) {
        if let Some(rt) = self.active.lock().remove(id) {
            rt.cancel.cancel();
        }
    }

    pub(crate) fn runtime(&self, id: &Uuid) -> Option<Arc<CampaignRuntime>> {
        self.active.lock().get(id).cloned()
    }

    pub(crate) fn paused_snapshot(&self, id: &Uuid) -> Option<PausedCampaign> {
        self.paused.lock().get(id).cloned()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn note_bus_lag(&self) {
        let until = chrono::Utc::now().timestamp_millis() + LAG_HOLD.as_millis() as i64;
        self.lag_until_ms.store(until, Ordering::Release);
        tracing::warn!("call.updates lag observed, halving dial rate");
    }

    /// Effective tick period: doubled while bus lag is held.
    pub(crate) fn effective_delay(&self, settings_delay_ms: u64) -> Duration {
        let lagged =
            chrono::Utc::now().timestamp_millis() < self.lag_until_ms.load(Ordering::Acquire);
        let ms = if lagged {
            settings_delay_ms.saturating_mul(2)
        } else {
            settings_delay_ms
        };
        Duration::from_millis(ms.max(10))
    }

    pub(crate) fn publish_campaign(&self, campaign: &Campaign) {
        let event = DomainEvent::CampaignUpdated {
            campaign: campaign.clone(),
        };
        self.bus.publish(&topics::campaign(&campaign.id), event.clone());
        self.bus.publish(topics::CAMPAIGN_UPDATES, event);
    }
}
