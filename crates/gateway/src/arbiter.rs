//! Termination arbiter — merges multi-source termination signals into
//! the single authoritative `terminatedBy` value.
//!
//! Every signal lands here instead of being scattered across webhook
//! handlers; the decision runs inside the call store's update closure,
//! so concurrent signals serialize on the store lock. The value is
//! written once; displaced and ignored signals are still recorded as
//! call events.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;

use vox_domain::events::topics;
use vox_domain::model::{
    Call, CallEvent, CallEventType, CallSid, EventSource, TerminatedBy,
};

use crate::bus::EventBus;
use vox_store::CallStore;

/// How long after an API terminate a natural signal can still be
/// displaced by `api_request`.
const API_DOMINANCE_WINDOW_SECS: i64 = 5;

/// Below this duration an unattributed completed call is treated as the
/// callee hanging up immediately.
const IMMEDIATE_HANGUP_SECS: u64 = 3;

/// What happened to a termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// First signal: written as-is.
    Applied,
    /// Replaced a fallback (`unknown`) value.
    Filled,
    /// `api_request` displaced a natural signal inside its window.
    Superseded,
    /// Logged only; the existing value stands.
    Ignored(TerminatedBy),
}

impl Decision {
    pub fn wrote(&self) -> bool {
        !matches!(self, Decision::Ignored(_))
    }
}

/// Optional classifier fed by the quality-insights webhook. Kept as an
/// integration point; no implementation ships by default.
pub trait QualityInsightsSource: Send + Sync {
    fn classify(&self, call: &Call, payload: &serde_json::Value) -> Option<TerminatedBy>;
}

pub struct TerminationArbiter {
    calls: Arc<CallStore>,
    bus: Arc<EventBus>,
    /// When `terminated_by` was written, per call. Backs the
    /// api_request dominance window.
    decided_at: Mutex<HashMap<CallSid, DateTime<Utc>>>,
    pub insights: Option<Arc<dyn QualityInsightsSource>>,
}

impl TerminationArbiter {
    pub fn new(calls: Arc<CallStore>, bus: Arc<EventBus>) -> Self {
        Self {
            calls,
            bus,
            decided_at: Mutex::new(HashMap::new()),
            insights: None,
        }
    }

    /// Feed one termination signal. Applies the arbitration rules and
    /// records the signal as a call event either way.
    pub fn signal(&self, sid: &str, source: EventSource, tag: TerminatedBy) -> Decision {
        let now = Utc::now();
        let prior_decision_at = self.decided_at.lock().get(sid).copied();

        let outcome = self.calls.update_call(sid, |call| {
            let current = match call.terminated_by {
                None => {
                    call.terminated_by = Some(tag);
                    return (Decision::Applied, call.clone());
                }
                Some(current) => current,
            };

            // AMD is sticky: once a machine answered, nothing later
            // reattributes the call.
            if current == TerminatedBy::AmdMachine {
                return (Decision::Ignored(current), call.clone());
            }

            // An explicit API terminate displaces a natural signal that
            // squeezed in during its dominance window.
            if tag == TerminatedBy::ApiRequest
                && current != TerminatedBy::ApiRequest
                && prior_decision_at
                    .map_or(false, |at| now - at <= Duration::seconds(API_DOMINANCE_WINDOW_SECS))
            {
                call.terminated_by = Some(tag);
                return (Decision::Superseded, call.clone());
            }

            // Fallback values are placeholders any real signal may fill.
            if current.is_fallback() {
                call.terminated_by = Some(tag);
                return (Decision::Filled, call.clone());
            }

            (Decision::Ignored(current), call.clone())
        });

        let (decision, call) = match outcome {
            Some(v) => v,
            None => {
                tracing::warn!(call_sid = %sid, ?tag, "termination signal for unknown call");
                return Decision::Ignored(TerminatedBy::Unknown);
            }
        };

        if decision.wrote() {
            self.decided_at.lock().insert(sid.to_string(), now);
        }

        let event = CallEvent::now(
            sid,
            CallEventType::StatusChange,
            source,
            json!({
                "signal": "termination",
                "tag": tag,
                "applied": decision.wrote(),
            }),
        );
        if let Err(e) = self.calls.append_event(event) {
            tracing::debug!(call_sid = %sid, error = %e, "could not log termination signal");
        }

        if decision.wrote() {
            tracing::info!(call_sid = %sid, ?tag, ?decision, "termination attributed");
            self.bus.publish_call(&call);
        } else {
            tracing::debug!(call_sid = %sid, ?tag, ?decision, "termination signal ignored");
        }
        decision
    }

    /// Map a terminal provider status to its natural tag and feed it.
    /// `completed` carries no tag of its own; the AI webhook, the
    /// bridge, or the finalization heuristic attributes it.
    pub fn signal_provider_terminal(&self, sid: &str, state: vox_domain::model::CallState) {
        use vox_domain::model::CallState;
        let tag = match state {
            CallState::Busy => TerminatedBy::UserBusy,
            CallState::NoAnswer => TerminatedBy::UserNoAnswer,
            CallState::Failed | CallState::Canceled => TerminatedBy::System,
            _ => return,
        };
        self.signal(sid, EventSource::Telephony, tag);
    }

    /// Last-resort attribution once the call is terminal and no source
    /// spoke up: a sub-3-second completed call reads as the callee
    /// hanging up on the greeting, anything else stays `unknown`.
    pub fn finalize(&self, sid: &str) {
        let updated = self.calls.update_call(sid, |call| {
            if !call.is_terminal() || call.terminated_by.is_some() {
                return None;
            }
            let duration = call.duration_secs.unwrap_or_else(|| {
                let start = call.answered_at.unwrap_or(call.created_at);
                call.ended_at
                    .map(|end| (end - start).num_seconds().max(0) as u64)
                    .unwrap_or(0)
            });
            let tag = if duration < IMMEDIATE_HANGUP_SECS {
                TerminatedBy::UserImmediateHangup
            } else {
                TerminatedBy::Unknown
            };
            call.terminated_by = Some(tag);
            Some((tag, call.clone()))
        });

        if let Some(Some((tag, call))) = updated {
            self.decided_at.lock().insert(sid.to_string(), Utc::now());
            tracing::info!(call_sid = %sid, ?tag, "termination attributed by heuristic");
            self.bus.publish_call(&call);
        }
    }

    /// Forget per-call bookkeeping once a call is settled.
    pub fn forget(&self, sid: &str) {
        self.decided_at.lock().remove(sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_domain::model::CallState;

    fn setup() -> (tempfile::TempDir, Arc<CallStore>, TerminationArbiter) {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(CallStore::new(dir.path()).unwrap());
        let bus = Arc::new(EventBus::new());
        let arbiter = TerminationArbiter::new(calls.clone(), bus);
        (dir, calls, arbiter)
    }

    fn seed(calls: &CallStore, sid: &str) {
        calls.upsert_call(Call::outbound(sid, "+15550100", "+15550101"));
    }

    #[test]
    fn amd_precedence_over_later_ai_signal() {
        // Scenario S2: AMD reports a machine, AI webhook lands later.
        let (_dir, calls, arbiter) = setup();
        seed(&calls, "CAX");

        assert_eq!(
            arbiter.signal("CAX", EventSource::Telephony, TerminatedBy::AmdMachine),
            Decision::Applied
        );
        assert_eq!(
            arbiter.signal("CAX", EventSource::Ai, TerminatedBy::Agent),
            Decision::Ignored(TerminatedBy::AmdMachine)
        );
        assert_eq!(
            calls.get("CAX").unwrap().terminated_by,
            Some(TerminatedBy::AmdMachine)
        );
    }

    #[test]
    fn first_arrival_wins_and_later_signals_only_log() {
        let (_dir, calls, arbiter) = setup();
        seed(&calls, "CA1");

        arbiter.signal("CA1", EventSource::Telephony, TerminatedBy::UserBusy);
        arbiter.signal("CA1", EventSource::Internal, TerminatedBy::SystemInactivity);
        assert_eq!(
            calls.get("CA1").unwrap().terminated_by,
            Some(TerminatedBy::UserBusy)
        );

        // Both signals are in the event log.
        let events = calls.events("CA1").unwrap();
        let termination_events = events
            .iter()
            .filter(|e| e.payload["signal"] == "termination")
            .count();
        assert_eq!(termination_events, 2);
        assert_eq!(events[1].payload["applied"], false);
    }

    #[test]
    fn api_request_displaces_natural_signal_in_window() {
        let (_dir, calls, arbiter) = setup();
        seed(&calls, "CA1");

        arbiter.signal("CA1", EventSource::Telephony, TerminatedBy::System);
        assert_eq!(
            arbiter.signal("CA1", EventSource::Internal, TerminatedBy::ApiRequest),
            Decision::Superseded
        );
        assert_eq!(
            calls.get("CA1").unwrap().terminated_by,
            Some(TerminatedBy::ApiRequest)
        );
    }

    #[test]
    fn ai_fills_heuristic_unknown_but_not_real_values() {
        let (_dir, calls, arbiter) = setup();
        seed(&calls, "CA1");
        calls.update_call("CA1", |c| {
            c.apply_transition(CallState::InProgress, Utc::now());
            c.duration_secs = Some(45);
            c.apply_transition(CallState::Completed, Utc::now());
        });

        arbiter.finalize("CA1");
        assert_eq!(
            calls.get("CA1").unwrap().terminated_by,
            Some(TerminatedBy::Unknown)
        );

        assert_eq!(
            arbiter.signal("CA1", EventSource::Ai, TerminatedBy::User),
            Decision::Filled
        );
        assert_eq!(
            calls.get("CA1").unwrap().terminated_by,
            Some(TerminatedBy::User)
        );

        // A second AI signal cannot overwrite the now-real value.
        assert_eq!(
            arbiter.signal("CA1", EventSource::Ai, TerminatedBy::Agent),
            Decision::Ignored(TerminatedBy::User)
        );
    }

    #[test]
    fn short_completed_call_reads_as_immediate_hangup() {
        // Scenario S3: completed, 2 s, no AMD signal.
        let (_dir, calls, arbiter) = setup();
        seed(&calls, "CA1");
        calls.update_call("CA1", |c| {
            c.duration_secs = Some(2);
            c.apply_transition(CallState::Completed, Utc::now());
        });

        arbiter.finalize("CA1");
        assert_eq!(
            calls.get("CA1").unwrap().terminated_by,
            Some(TerminatedBy::UserImmediateHangup)
        );

        // The heuristic value is not `unknown`, so the AI may not
        // replace it.
        assert_eq!(
            arbiter.signal("CA1", EventSource::Ai, TerminatedBy::Agent),
            Decision::Ignored(TerminatedBy::UserImmediateHangup)
        );
    }

    #[test]
    fn provider_terminal_states_map_to_natural_tags() {
        let (_dir, calls, arbiter) = setup();
        for (sid, state, expect) in [
            ("CAB", CallState::Busy, TerminatedBy::UserBusy),
            ("CAN", CallState::NoAnswer, TerminatedBy::UserNoAnswer),
            ("CAF", CallState::Failed, TerminatedBy::System),
        ] {
            seed(&calls, sid);
            arbiter.signal_provider_terminal(sid, state);
            assert_eq!(calls.get(sid).unwrap().terminated_by, Some(expect));
        }

        // Completed carries no natural tag.
        seed(&calls, "CAC");
        arbiter.signal_provider_terminal("CAC", CallState::Completed);
        assert_eq!(calls.get("CAC").unwrap().terminated_by, None);
    }

    #[test]
    fn finalize_is_a_noop_when_already_attributed() {
        let (_dir, calls, arbiter) = setup();
        seed(&calls, "CA1");
        arbiter.signal("CA1", EventSource::Telephony, TerminatedBy::UserBusy);
        calls.update_call("CA1", |c| {
            c.apply_transition(CallState::Busy, Utc::now());
        });
        arbiter.finalize("CA1");
        assert_eq!(
            calls.get("CA1").unwrap().terminated_by,
            Some(TerminatedBy::UserBusy)
        );
    }
}
