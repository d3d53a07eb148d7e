//! Shared application state and component assembly.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use vox_domain::config::Config;
use vox_domain::{Error, Result};
use vox_store::{CallStore, CampaignStore, ContactStore};

use crate::ai::AiProvider;
use crate::arbiter::TerminationArbiter;
use crate::bridge::{BridgeContext, BridgeRegistry};
use crate::bus::EventBus;
use crate::engine::CampaignEngine;
use crate::hub::HubContext;
use crate::telephony::{CallGateway, TelephonyProvider};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    // ── Stores ────────────────────────────────────────────────────────
    pub campaigns: Arc<CampaignStore>,
    pub contacts: Arc<ContactStore>,
    pub calls: Arc<CallStore>,

    // ── Components ────────────────────────────────────────────────────
    pub bus: Arc<EventBus>,
    pub arbiter: Arc<TerminationArbiter>,
    pub gateway: Arc<CallGateway>,
    pub engine: Arc<CampaignEngine>,
    pub bridge: Arc<BridgeContext>,
    pub hub: Arc<HubContext>,

    /// SHA-256 of `API_KEY`, cached for constant-time comparison.
    pub api_key_hash: Option<Vec<u8>>,
    /// Plain HTTP client for recording proxying and CRM dispatch.
    pub http: reqwest::Client,
}

impl AppState {
    /// Wire every component together. The provider seams are injected
    /// so the binary passes real REST clients and tests pass scripted
    /// ones.
    pub fn assemble(
        config: Arc<Config>,
        provider: Arc<dyn TelephonyProvider>,
        ai: Arc<dyn AiProvider>,
    ) -> Result<Self> {
        let state_dir = &config.store.state_dir;
        std::fs::create_dir_all(state_dir)
            .map_err(|e| Error::Config(format!("state dir {}: {e}", state_dir.display())))?;

        let campaigns = Arc::new(CampaignStore::new(state_dir)?);
        let contacts = Arc::new(ContactStore::new(state_dir)?);
        let calls = Arc::new(CallStore::new(state_dir)?);

        let bus = Arc::new(EventBus::new());
        let arbiter = Arc::new(TerminationArbiter::new(calls.clone(), bus.clone()));
        let gateway = Arc::new(CallGateway::new(
            provider,
            ai.clone(),
            calls.clone(),
            bus.clone(),
            arbiter.clone(),
            config.clone(),
        ));

        let bridge = Arc::new(BridgeContext {
            calls: calls.clone(),
            bus: bus.clone(),
            ai,
            gateway: gateway.clone(),
            arbiter: arbiter.clone(),
            registry: Arc::new(BridgeRegistry::new()),
            inactivity: Duration::from_millis(config.engine.inactivity_ms),
            duration_cap: Duration::from_millis(config.engine.duration_cap_ms),
        });

        let engine = CampaignEngine::new(
            campaigns.clone(),
            contacts.clone(),
            bus.clone(),
            gateway.clone(),
            config.engine.clone(),
        );

        let hub = Arc::new(HubContext {
            calls: calls.clone(),
            campaigns: campaigns.clone(),
            bus: bus.clone(),
        });

        let api_key_hash = config
            .server
            .api_key
            .as_deref()
            .map(|key| Sha256::digest(key.as_bytes()).to_vec());

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;

        Ok(Self {
            config,
            campaigns,
            contacts,
            calls,
            bus,
            arbiter,
            gateway,
            engine,
            bridge,
            hub,
            api_key_hash,
            http,
        })
    }

    /// Periodic maintenance: call-store flush and the contact-lock
    /// sweeper. Spawned once by the binary after assembly.
    pub fn spawn_maintenance(&self) {
        {
            let calls = self.calls.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(5));
                loop {
                    interval.tick().await;
                    calls.flush_if_dirty().await;
                }
            });
        }
        {
            let contacts = self.contacts.clone();
            let calls = self.calls.clone();
            let engine = self.engine.clone();
            let grace = chrono::Duration::seconds(self.config.engine.sweep_grace_secs as i64);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                loop {
                    interval.tick().await;
                    contacts
                        .release_expired(grace, &|contact_id| {
                            engine.contact_in_flight(contact_id)
                                || calls.has_live_call_for_contact(contact_id)
                        })
                        .await;
                }
            });
        }
    }
}
