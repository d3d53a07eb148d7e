//! Media bridge — the dual-WebSocket proxy between the telephony
//! provider's media stream and the AI provider's conversation socket.
//!
//! Flow:
//! 1. Provider connects to `/outbound-media-stream` and sends `start`
//!    with the call sid + custom parameters.
//! 2. The bridge fetches a signed URL and opens the AI socket.
//! 3. Audio is forwarded both ways; transcript deltas fan out on the
//!    bus; an activity watchdog enforces the inactivity and duration
//!    ceilings.
//! 4. Teardown cancels both loops, closes both sockets, terminates the
//!    provider call and finalizes attribution.

pub mod frames;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use vox_domain::model::CallSid;
use vox_store::CallStore;

use crate::ai::AiProvider;
use crate::arbiter::TerminationArbiter;
use crate::bus::EventBus;
use crate::state::AppState;
use crate::telephony::CallGateway;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Pending,
    AwaitingInit,
    Active,
    Terminating,
    Closed,
}

impl BridgeState {
    /// Whether `next` is a legal successor. Forward-only: the session
    /// never re-enters an earlier state.
    pub fn can_advance(&self, next: BridgeState) -> bool {
        use BridgeState::*;
        matches!(
            (self, next),
            (Pending, AwaitingInit)
                | (AwaitingInit, Active)
                | (Pending, Terminating)
                | (AwaitingInit, Terminating)
                | (Active, Terminating)
                | (Terminating, Closed)
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SessionSlot {
    info: SessionInfo,
    cancel: CancellationToken,
}

/// Listing/lookup view of one live bridge session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub call_sid: CallSid,
    pub conversation_id: Option<String>,
    pub state: BridgeState,
    pub started_at: DateTime<Utc>,
}

/// Process-wide map of live bridge sessions. The mutex is only held for
/// lookup, insert/remove and listing, never across I/O.
#[derive(Default)]
pub struct BridgeRegistry {
    sessions: Mutex<HashMap<CallSid, SessionSlot>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, call_sid: &str, cancel: CancellationToken) {
        let info = SessionInfo {
            call_sid: call_sid.to_string(),
            conversation_id: None,
            state: BridgeState::AwaitingInit,
            started_at: Utc::now(),
        };
        self.sessions
            .lock()
            .insert(call_sid.to_string(), SessionSlot { info, cancel });
    }

    /// Advance a session's state, refusing illegal jumps.
    pub fn advance(&self, call_sid: &str, next: BridgeState) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(call_sid) {
            Some(slot) if slot.info.state.can_advance(next) => {
                slot.info.state = next;
                true
            }
            _ => false,
        }
    }

    pub fn set_conversation_id(&self, call_sid: &str, conversation_id: &str) {
        if let Some(slot) = self.sessions.lock().get_mut(call_sid) {
            slot.info.conversation_id = Some(conversation_id.to_string());
        }
    }

    pub fn get(&self, call_sid: &str) -> Option<SessionInfo> {
        self.sessions.lock().get(call_sid).map(|s| s.info.clone())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.lock().values().map(|s| s.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel a live session's task tree. Returns false when no session
    /// exists for the sid.
    pub fn terminate(&self, call_sid: &str) -> bool {
        match self.sessions.lock().get(call_sid) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, call_sid: &str) {
        self.sessions.lock().remove(call_sid);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context + HTTP entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a bridge session needs, bundled once at startup.
pub struct BridgeContext {
    pub calls: Arc<CallStore>,
    pub bus: Arc<EventBus>,
    pub ai: Arc<dyn AiProvider>,
    pub gateway: Arc<CallGateway>,
    pub arbiter: Arc<TerminationArbiter>,
    pub registry: Arc<BridgeRegistry>,
    pub inactivity: Duration,
    pub duration_cap: Duration,
}

/// `GET /outbound-media-stream` — the provider's media WebSocket.
pub async fn media_stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let ctx = state.bridge.clone();
    ws.on_upgrade(move |socket| session::run(socket, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_is_forward_only() {
        use BridgeState::*;
        assert!(Pending.can_advance(AwaitingInit));
        assert!(AwaitingInit.can_advance(Active));
        assert!(Active.can_advance(Terminating));
        assert!(Terminating.can_advance(Closed));

        assert!(!Active.can_advance(AwaitingInit));
        assert!(!Terminating.can_advance(Active));
        assert!(!Closed.can_advance(Terminating));
        assert!(!Pending.can_advance(Active));
    }

    #[test]
    fn registry_advance_refuses_illegal_jumps() {
        let registry = BridgeRegistry::new();
        registry.register("CA1", CancellationToken::new());

        assert!(!registry.advance("CA1", BridgeState::Closed));
        assert!(registry.advance("CA1", BridgeState::Active));
        assert_eq!(registry.get("CA1").unwrap().state, BridgeState::Active);
        assert!(registry.advance("CA1", BridgeState::Terminating));
        assert!(registry.advance("CA1", BridgeState::Closed));
    }

    #[test]
    fn registry_terminate_cancels_token() {
        let registry = BridgeRegistry::new();
        let cancel = CancellationToken::new();
        registry.register("CA1", cancel.clone());

        assert!(registry.terminate("CA1"));
        assert!(cancel.is_cancelled());
        assert!(!registry.terminate("CA404"));

        registry.remove("CA1");
        assert!(registry.is_empty());
    }
}
