//! End-to-end campaign engine scenarios against a scripted telephony
//! provider: claim → dial → outcome bookkeeping, pause/resume/stop
//! semantics, the concurrency cap, and funds-exhaustion auto-pause.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use vox_domain::config::Config;
use vox_domain::model::{
    CallState, Campaign, CampaignSettings, CampaignState, Contact, ContactStatus,
    EventSource, TerminatedBy,
};
use vox_domain::{Error, Result};
use vox_gateway::ai::AiProvider;
use vox_gateway::state::AppState;
use vox_gateway::telephony::{CreateCallParams, TelephonyProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Copy, PartialEq)]
enum DialScript {
    Succeed,
    InsufficientFunds,
}

struct MockTelephony {
    script: Mutex<DialScript>,
    created: Mutex<Vec<CreateCallParams>>,
    counter: AtomicUsize,
}

impl MockTelephony {
    fn new(script: DialScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            created: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        })
    }

    fn create_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl TelephonyProvider for MockTelephony {
    async fn create_call(&self, params: &CreateCallParams) -> Result<String> {
        self.created.lock().push(params.clone());
        match *self.script.lock() {
            DialScript::Succeed => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("CA{n:04}"))
            }
            DialScript::InsufficientFunds => Err(Error::Provider {
                provider: "telephony".into(),
                reason: "insufficient_funds".into(),
            }),
        }
    }

    async fn terminate_call(&self, _call_sid: &str) -> Result<()> {
        Ok(())
    }
}

struct StubAi;

#[async_trait]
impl AiProvider for StubAi {
    async fn signed_url(&self) -> Result<String> {
        Ok("wss://ai.test/signed".into())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn test_config(state_dir: &std::path::Path) -> Arc<Config> {
    let mut config = Config::default();
    config.server.public_url = "https://calls.test".into();
    config.telephony.account_sid = "AC_test".into();
    config.telephony.auth_token = "token".into();
    config.telephony.outbound_number = "+15550100".into();
    config.ai.api_key = "xi_test".into();
    config.ai.agent_id = "agent_test".into();
    config.store.state_dir = state_dir.to_path_buf();
    Arc::new(config)
}

struct Harness {
    _dir: tempfile::TempDir,
    provider: Arc<MockTelephony>,
    state: AppState,
}

fn harness(script: DialScript) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockTelephony::new(script);
    let state = AppState::assemble(
        test_config(dir.path()),
        provider.clone(),
        Arc::new(StubAi),
    )
    .unwrap();
    Harness {
        _dir: dir,
        provider,
        state,
    }
}

async fn seeded_campaign(
    state: &AppState,
    settings: CampaignSettings,
    contact_count: usize,
) -> Uuid {
    let campaign = Campaign::new("test campaign", settings);
    let id = campaign.id;
    state.campaigns.insert(campaign).await;

    let contacts: Vec<Contact> = (0..contact_count)
        .map(|i| Contact::new(format!("+1555020{i:04}"), format!("contact {i}")))
        .collect();
    state.contacts.add_to_campaign(id, contacts).await;
    state
        .campaigns
        .update(&id, |c| c.stats.total_contacts = contact_count as u64)
        .await;
    id
}

fn fast_settings(delay_ms: u64, cap: usize) -> CampaignSettings {
    CampaignSettings {
        call_delay_ms: delay_ms,
        max_concurrent_calls: cap,
        ..CampaignSettings::default()
    }
}

/// Drive a dialed call to a terminal state the way a finished agent
/// conversation would: the bridge attributes the hang-up first, then
/// the provider's completed callback lands.
fn complete_call(state: &AppState, sid: &str, duration: u64) {
    state
        .arbiter
        .signal(sid, EventSource::Ai, TerminatedBy::Agent);
    let call = state
        .calls
        .update_call(sid, |c| {
            c.apply_transition(CallState::InProgress, Utc::now());
            c.duration_secs = Some(duration);
            c.apply_transition(CallState::Completed, Utc::now());
            c.clone()
        })
        .unwrap();
    state.bus.publish_call(&call);
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn pause_mid_dial_stops_new_calls() {
    // Scenario S1: cap 1, three contacts. One dial, then pause.
    let h = harness(DialScript::Succeed);
    let id = seeded_campaign(&h.state, fast_settings(100, 1), 3).await;

    h.state.engine.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.provider.create_count(), 1, "first tick dials exactly one");

    assert!(h.state.engine.pause(&id).await);
    assert_eq!(
        h.state.campaigns.get(&id).unwrap().state,
        CampaignState::Paused
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        h.provider.create_count(),
        1,
        "no new provider calls after pause returned"
    );

    // The in-flight call still completes and updates stats.
    complete_call(&h.state, "CA0000", 30);
    settle().await;
    let campaign = h.state.campaigns.get(&id).unwrap();
    assert_eq!(campaign.stats.calls_completed, 1);
    assert_eq!(h.state.engine.in_flight_count(&id), 0);
}

#[tokio::test]
async fn zero_contact_campaign_completes_immediately() {
    let h = harness(DialScript::Succeed);
    let id = seeded_campaign(&h.state, fast_settings(50, 2), 0).await;

    h.state.engine.start(&id).await.unwrap();
    settle().await;

    assert_eq!(
        h.state.campaigns.get(&id).unwrap().state,
        CampaignState::Completed
    );
    assert!(!h.state.engine.is_active(&id));
    assert_eq!(h.provider.create_count(), 0);
}

#[tokio::test]
async fn concurrency_cap_holds_until_outcomes_free_slots() {
    let h = harness(DialScript::Succeed);
    let id = seeded_campaign(&h.state, fast_settings(40, 2), 5).await;

    h.state.engine.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        h.provider.create_count(),
        2,
        "cap bounds in-flight dials across ticks"
    );
    assert_eq!(h.state.engine.in_flight_count(&id), 2);

    complete_call(&h.state, "CA0000", 10);
    complete_call(&h.state, "CA0001", 12);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.provider.create_count() >= 4, "freed slots are refilled");

    // Drain the rest as the cap lets them through; the campaign must
    // finish on its own.
    for n in 2..5 {
        let sid = format!("CA{n:04}");
        for _ in 0..100 {
            if h.state.calls.get(&sid).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        complete_call(&h.state, &sid, 10);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let campaign = h.state.campaigns.get(&id).unwrap();
    assert_eq!(campaign.state, CampaignState::Completed);
    assert_eq!(campaign.stats.calls_placed, 5);
    assert_eq!(campaign.stats.calls_completed, 5);
    assert!(campaign.stats.calls_placed >= campaign.stats.calls_completed);

    for contact in h.state.contacts.list_for_campaign(&id) {
        assert_eq!(contact.status, ContactStatus::Called);
        assert_eq!(contact.call_count, 1);
    }
}

#[tokio::test]
async fn insufficient_funds_auto_pauses_campaign() {
    let h = harness(DialScript::InsufficientFunds);
    let id = seeded_campaign(&h.state, fast_settings(40, 5), 5).await;

    h.state.engine.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let campaign = h.state.campaigns.get(&id).unwrap();
    assert_eq!(campaign.state, CampaignState::Paused, "auto-paused on funds");
    assert!(!h.state.engine.is_active(&id));
    assert!(h.state.engine.is_paused(&id));

    // The rejected contacts are failed, not re-pended.
    let failed = h
        .state
        .contacts
        .list_for_campaign(&id)
        .into_iter()
        .filter(|c| c.status == ContactStatus::Failed)
        .count();
    assert_eq!(failed, 3, "threshold-worth of contacts marked failed");
    assert_eq!(campaign.stats.calls_failed, 3);
}

#[tokio::test]
async fn failed_create_marks_contact_failed_and_campaign_continues() {
    let h = harness(DialScript::InsufficientFunds);
    let id = seeded_campaign(&h.state, fast_settings(40, 1), 2).await;

    h.state.engine.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    // One failed create does not pause anything.
    assert!(h.state.engine.is_active(&id));
    *h.provider.script.lock() = DialScript::Succeed;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        h.provider.create_count() >= 2,
        "campaign keeps dialing after a failed create"
    );
    let statuses: Vec<ContactStatus> = h
        .state
        .contacts
        .list_for_campaign(&id)
        .into_iter()
        .map(|c| c.status)
        .collect();
    assert!(statuses.contains(&ContactStatus::Failed));
}

#[tokio::test]
async fn start_pause_resume_stop_round_trip() {
    let h = harness(DialScript::Succeed);
    let id = seeded_campaign(&h.state, fast_settings(60, 1), 2).await;

    h.state.engine.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(h.provider.create_count(), 1);

    // Starting again while active is a conflict.
    assert!(matches!(
        h.state.engine.start(&id).await,
        Err(Error::Conflict(_))
    ));

    assert!(h.state.engine.pause(&id).await);
    assert!(!h.state.engine.pause(&id).await, "second pause is a no-op");

    h.state.engine.resume(&id).await.unwrap();
    assert!(h.state.engine.is_active(&id));
    tokio::time::sleep(Duration::from_millis(200)).await;
    // Cap 1 with the first call still in flight: resume dials nothing.
    assert_eq!(h.provider.create_count(), 1);

    assert!(h.state.engine.stop(&id).await);
    let campaign = h.state.campaigns.get(&id).unwrap();
    assert_eq!(campaign.state, CampaignState::Cancelled);
    assert!(!h.state.engine.is_active(&id));
    assert!(!h.state.engine.is_paused(&id));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.provider.create_count(), 1, "no dialing after stop");

    // Nothing may be left stuck in processing forever: the in-flight
    // call's contact settles via the sweeper once its lease lapses.
    let released = h
        .state
        .contacts
        .release_expired(chrono::Duration::seconds(-200), &|_| false)
        .await;
    assert_eq!(released, 1);
    for contact in h.state.contacts.list_for_campaign(&id) {
        assert_ne!(contact.status, ContactStatus::Processing);
    }
}

#[tokio::test]
async fn resume_unknown_campaign_is_conflict() {
    let h = harness(DialScript::Succeed);
    assert!(matches!(
        h.state.engine.resume(&Uuid::new_v4()).await,
        Err(Error::Conflict(_))
    ));
    assert!(!h.state.engine.stop(&Uuid::new_v4()).await);
}

#[tokio::test]
async fn duration_capped_call_counts_as_failed() {
    let h = harness(DialScript::Succeed);
    let id = seeded_campaign(&h.state, fast_settings(50, 1), 1).await;

    h.state.engine.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(h.provider.create_count(), 1);

    // The bridge hit the 10-minute ceiling: attribution first, then the
    // provider teardown completes the call.
    h.state
        .arbiter
        .signal("CA0000", EventSource::Internal, TerminatedBy::DurationLimit);
    let call = h
        .state
        .calls
        .update_call("CA0000", |c| {
            c.apply_transition(CallState::InProgress, Utc::now());
            c.duration_secs = Some(600);
            c.apply_transition(CallState::Completed, Utc::now());
            c.clone()
        })
        .unwrap();
    h.state.bus.publish_call(&call);
    settle().await;

    // A duration-capped call is not a successful contact.
    let contact = &h.state.contacts.list_for_campaign(&id)[0];
    assert_eq!(contact.status, ContactStatus::Failed);
    let campaign = h.state.campaigns.get(&id).unwrap();
    assert_eq!(campaign.stats.calls_failed, 1);
    assert_eq!(campaign.stats.calls_completed, 0);
    assert_eq!(campaign.stats.avg_duration_sec, 0.0);
    assert!(
        campaign.stats.calls_placed
            >= campaign.stats.calls_completed + campaign.stats.calls_failed
    );
    assert_eq!(campaign.state, CampaignState::Completed);
}

#[tokio::test]
async fn short_hangup_call_counts_as_failed() {
    let h = harness(DialScript::Succeed);
    let id = seeded_campaign(&h.state, fast_settings(50, 1), 1).await;

    h.state.engine.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(h.provider.create_count(), 1);

    // Completed after 2 s with no source attribution; the heuristic
    // fills user_immediate_hangup before the terminal event goes out,
    // exactly as the status-callback handler sequences it.
    h.state
        .calls
        .update_call("CA0000", |c| {
            c.apply_transition(CallState::InProgress, Utc::now());
            c.duration_secs = Some(2);
            c.apply_transition(CallState::Completed, Utc::now());
        })
        .unwrap();
    h.state.arbiter.finalize("CA0000");
    settle().await;

    assert_eq!(
        h.state.calls.get("CA0000").unwrap().terminated_by,
        Some(TerminatedBy::UserImmediateHangup)
    );
    let contact = &h.state.contacts.list_for_campaign(&id)[0];
    assert_eq!(contact.status, ContactStatus::Failed);
    let campaign = h.state.campaigns.get(&id).unwrap();
    assert_eq!(campaign.stats.calls_failed, 1);
    assert_eq!(campaign.stats.calls_completed, 0);
    assert_eq!(campaign.state, CampaignState::Completed);
}

#[tokio::test]
async fn busy_outcome_marks_contact_failed() {
    let h = harness(DialScript::Succeed);
    let id = seeded_campaign(&h.state, fast_settings(50, 1), 1).await;

    h.state.engine.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(h.provider.create_count(), 1);

    // Provider reports busy; the arbiter tags it, the outcome handler
    // settles the contact as failed.
    let call = h
        .state
        .calls
        .update_call("CA0000", |c| {
            c.apply_transition(CallState::Busy, Utc::now());
            c.clone()
        })
        .unwrap();
    h.state.arbiter.signal_provider_terminal("CA0000", CallState::Busy);
    h.state.bus.publish_call(&call);
    settle().await;

    let contact = &h.state.contacts.list_for_campaign(&id)[0];
    assert_eq!(contact.status, ContactStatus::Failed);
    let campaign = h.state.campaigns.get(&id).unwrap();
    assert_eq!(campaign.stats.calls_failed, 1);
    assert_eq!(campaign.state, CampaignState::Completed);
    assert_eq!(
        h.state.calls.get("CA0000").unwrap().terminated_by,
        Some(TerminatedBy::UserBusy)
    );
}
