//! Persisted entities: campaigns, contacts, calls, events, transcripts,
//! recordings.
//!
//! Wire/persisted field names are camelCase to match what the dashboard
//! consumes; lifecycle enums serialize to the provider's own vocabulary
//! (`in-progress`, `no-answer`, `machine_start`, …).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Campaign
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignState {
    Draft,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignState {
    /// Completed and cancelled campaigns never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignState::Completed | CampaignState::Cancelled)
    }
}

/// Per-campaign dialing knobs, snapshotted by the engine when the
/// campaign starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSettings {
    #[serde(default = "d_call_delay_ms")]
    pub call_delay_ms: u64,
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_calls: usize,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "d_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub dialer_prompt: Option<String>,
    #[serde(default)]
    pub first_message: Option<String>,
    /// E.164 caller id; falls back to the configured outbound number.
    #[serde(default)]
    pub caller_id: Option<String>,
}

fn d_call_delay_ms() -> u64 {
    5_000
}
fn d_max_concurrent() -> usize {
    5
}
fn d_retry_delay_ms() -> u64 {
    60_000
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            call_delay_ms: d_call_delay_ms(),
            max_concurrent_calls: d_max_concurrent(),
            retry_count: 0,
            retry_delay_ms: d_retry_delay_ms(),
            dialer_prompt: None,
            first_message: None,
            caller_id: None,
        }
    }
}

/// Rolling campaign counters. Invariant: `calls_placed >=
/// calls_completed + calls_failed`; maintained by incrementing
/// `calls_placed` before a call exists and the terminal counters only
/// from the single outcome handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStats {
    pub total_contacts: u64,
    pub calls_placed: u64,
    pub calls_answered: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
    pub avg_duration_sec: f64,
}

impl CampaignStats {
    /// Fold one completed-call duration into the rolling average.
    pub fn record_completed(&mut self, duration_secs: u64) {
        self.calls_completed += 1;
        let n = self.calls_completed as f64;
        self.avg_duration_sec += (duration_secs as f64 - self.avg_duration_sec) / n;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub state: CampaignState,
    #[serde(default)]
    pub settings: CampaignSettings,
    #[serde(default)]
    pub stats: CampaignStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(name: impl Into<String>, settings: CampaignSettings) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state: CampaignState::Draft,
            settings,
            stats: CampaignStats::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contact
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Pending,
    Processing,
    Called,
    Failed,
    #[serde(rename = "do-not-call")]
    DoNotCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: Uuid,
    /// E.164, unique across the store.
    pub phone: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub status: ContactStatus,
    /// Monotonically non-decreasing dial counter.
    #[serde(default)]
    pub call_count: u32,
    #[serde(default)]
    pub last_contacted_at: Option<DateTime<Utc>>,
    /// Claim lease; a `Processing` contact past this instant is
    /// reclaimed by the sweeper.
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub campaign_ids: BTreeSet<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(phone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            phone: phone.into(),
            name: name.into(),
            email: None,
            status: ContactStatus::Pending,
            call_count: 0,
            last_contacted_at: None,
            locked_until: None,
            priority: 0,
            campaign_ids: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    /// Eligible for claiming by the given campaign right now.
    pub fn claimable(&self, campaign_id: &Uuid, now: DateTime<Utc>) -> bool {
        self.status == ContactStatus::Pending
            && self.call_count == 0
            && self.campaign_ids.contains(campaign_id)
            && self.locked_until.map_or(true, |t| t < now)
    }
}

/// Terminal disposition of one dial attempt, used to map a contact out
/// of `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOutcome {
    Called,
    Failed,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Provider call-sid; calls are keyed by the provider's identity.
pub type CallSid = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Busy,
    Failed,
    NoAnswer,
    Canceled,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Completed
                | CallState::Busy
                | CallState::Failed
                | CallState::NoAnswer
                | CallState::Canceled
        )
    }

    /// Parse the provider's status-callback vocabulary. `queued` maps to
    /// `Initiated`; unknown strings are rejected.
    pub fn from_provider(s: &str) -> Option<Self> {
        Some(match s {
            "queued" | "initiated" => CallState::Initiated,
            "ringing" => CallState::Ringing,
            "in-progress" | "answered" => CallState::InProgress,
            "completed" => CallState::Completed,
            "busy" => CallState::Busy,
            "failed" => CallState::Failed,
            "no-answer" => CallState::NoAnswer,
            "canceled" => CallState::Canceled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnsweredBy {
    Human,
    MachineStart,
    MachineEndBeep,
    MachineEndSilence,
    Fax,
    Unknown,
}

impl AnsweredBy {
    pub fn is_machine(&self) -> bool {
        matches!(
            self,
            AnsweredBy::MachineStart
                | AnsweredBy::MachineEndBeep
                | AnsweredBy::MachineEndSilence
                | AnsweredBy::Fax
        )
    }

    pub fn from_provider(s: &str) -> Self {
        match s {
            "human" => AnsweredBy::Human,
            "machine_start" => AnsweredBy::MachineStart,
            "machine_end_beep" => AnsweredBy::MachineEndBeep,
            "machine_end_silence" => AnsweredBy::MachineEndSilence,
            "fax" => AnsweredBy::Fax,
            _ => AnsweredBy::Unknown,
        }
    }
}

/// Canonical termination attribution, written once by the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatedBy {
    UserBusy,
    UserNoAnswer,
    System,
    AmdMachine,
    Agent,
    User,
    SystemInactivity,
    DurationLimit,
    ApiRequest,
    UserImmediateHangup,
    Unknown,
}

impl TerminatedBy {
    /// Heuristic fallback tags may be replaced by a real signal; every
    /// other value is final.
    pub fn is_fallback(&self) -> bool {
        matches!(self, TerminatedBy::Unknown)
    }

    /// Tags that mean the callee was reached and the conversation ran.
    pub fn counts_as_called(&self) -> bool {
        matches!(
            self,
            TerminatedBy::Agent | TerminatedBy::User | TerminatedBy::AmdMachine
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    /// Provider call-sid.
    pub sid: CallSid,
    #[serde(default)]
    pub campaign_id: Option<Uuid>,
    #[serde(default)]
    pub contact_id: Option<Uuid>,
    pub state: CallState,
    pub direction: CallDirection,
    pub from: String,
    pub to: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    /// AI-provider conversation id, captured by the bridge.
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub answered_by: Option<AnsweredBy>,
    #[serde(default)]
    pub terminated_by: Option<TerminatedBy>,
    #[serde(default)]
    pub recording_sids: Vec<String>,
}

impl Call {
    pub fn outbound(
        sid: impl Into<CallSid>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            sid: sid.into(),
            campaign_id: None,
            contact_id: None,
            state: CallState::Initiated,
            direction: CallDirection::Outbound,
            from: from.into(),
            to: to.into(),
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            duration_secs: None,
            conversation_id: None,
            answered_by: None,
            terminated_by: None,
            recording_sids: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a status transition, enforcing the terminal sink and the
    /// `ended_at >= answered_at >= created_at` ordering. Returns whether
    /// the state actually changed.
    pub fn apply_transition(&mut self, next: CallState, at: DateTime<Utc>) -> bool {
        if self.state.is_terminal() || self.state == next {
            return false;
        }
        self.state = next;
        match next {
            CallState::InProgress => {
                let at = at.max(self.created_at);
                self.answered_at.get_or_insert(at);
            }
            s if s.is_terminal() => {
                let floor = self.answered_at.unwrap_or(self.created_at);
                self.ended_at.get_or_insert(at.max(floor));
            }
            _ => {}
        }
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEventType {
    StatusChange,
    MachineDetection,
    RecordingUpdate,
    QualityUpdate,
    TranscriptMessage,
    CrmSend,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Telephony,
    Ai,
    Internal,
}

/// Append-only per-call log entry. Timestamps within one call are
/// non-decreasing; the store clamps stragglers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEvent {
    pub call_sid: CallSid,
    pub timestamp: DateTime<Utc>,
    pub event_type: CallEventType,
    pub source: EventSource,
    pub payload: serde_json::Value,
}

impl CallEvent {
    pub fn now(
        call_sid: impl Into<CallSid>,
        event_type: CallEventType,
        source: EventSource,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            call_sid: call_sid.into(),
            timestamp: Utc::now(),
            event_type,
            source,
            payload,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transcript
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtteranceRole {
    Agent,
    User,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utterance {
    pub role: UtteranceRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptAnalysis {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

/// One transcript per call. Appends stop once `frozen` (set when the
/// post-call analysis is applied).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    #[serde(default)]
    pub utterances: Vec<Utterance>,
    #[serde(default)]
    pub analysis: Option<TranscriptAnalysis>,
    #[serde(default)]
    pub frozen: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recording
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    /// Provider-assigned recording sid.
    pub sid: String,
    pub call_sid: CallSid,
    pub status: RecordingStatus,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub channels: Option<u8>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn call_state_provider_vocabulary() {
        assert_eq!(CallState::from_provider("queued"), Some(CallState::Initiated));
        assert_eq!(
            CallState::from_provider("in-progress"),
            Some(CallState::InProgress)
        );
        assert_eq!(CallState::from_provider("no-answer"), Some(CallState::NoAnswer));
        assert_eq!(CallState::from_provider("ended"), None);
    }

    #[test]
    fn terminal_states_are_sinks() {
        let mut call = Call::outbound("CA123", "+15550100", "+15550101");
        assert!(call.apply_transition(CallState::Ringing, Utc::now()));
        assert!(call.apply_transition(CallState::InProgress, Utc::now()));
        assert!(call.apply_transition(CallState::Completed, Utc::now()));
        // No way out of a terminal state.
        assert!(!call.apply_transition(CallState::InProgress, Utc::now()));
        assert!(!call.apply_transition(CallState::Failed, Utc::now()));
        assert_eq!(call.state, CallState::Completed);
    }

    #[test]
    fn transition_timestamps_are_ordered() {
        let mut call = Call::outbound("CA123", "+15550100", "+15550101");
        let early = call.created_at - Duration::seconds(30);
        call.apply_transition(CallState::InProgress, early);
        // A stale webhook timestamp is clamped to created_at.
        assert!(call.answered_at.unwrap() >= call.created_at);
        call.apply_transition(CallState::Completed, early);
        assert!(call.ended_at.unwrap() >= call.answered_at.unwrap());
    }

    #[test]
    fn claimable_requires_pending_and_unlocked() {
        let campaign = Uuid::new_v4();
        let now = Utc::now();
        let mut contact = Contact::new("+15550100", "Ada");
        contact.campaign_ids.insert(campaign);
        assert!(contact.claimable(&campaign, now));

        contact.locked_until = Some(now + Duration::seconds(60));
        assert!(!contact.claimable(&campaign, now));

        contact.locked_until = Some(now - Duration::seconds(1));
        assert!(contact.claimable(&campaign, now));

        contact.call_count = 1;
        assert!(!contact.claimable(&campaign, now));
    }

    #[test]
    fn stats_rolling_average() {
        let mut stats = CampaignStats::default();
        stats.record_completed(10);
        stats.record_completed(20);
        stats.record_completed(30);
        assert_eq!(stats.calls_completed, 3);
        assert!((stats.avg_duration_sec - 20.0).abs() < 1e-9);
    }

    #[test]
    fn answered_by_machine_classification() {
        assert!(AnsweredBy::from_provider("machine_start").is_machine());
        assert!(AnsweredBy::from_provider("machine_end_beep").is_machine());
        assert!(!AnsweredBy::from_provider("human").is_machine());
        assert_eq!(AnsweredBy::from_provider("garbled"), AnsweredBy::Unknown);
    }

    #[test]
    fn serde_round_trip_uses_wire_names() {
        let call = Call::outbound("CA9", "+1", "+2");
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["state"], "initiated");
        assert!(json.get("createdAt").is_some());

        let tb = serde_json::to_value(TerminatedBy::UserImmediateHangup).unwrap();
        assert_eq!(tb, "user_immediate_hangup");
    }
}
