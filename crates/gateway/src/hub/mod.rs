//! Real-time hub — long-lived dashboard connections with room
//! subscriptions and reconnection-safe snapshots.
//!
//! Protocol (JSON frames `{event, data}` over `/socket.io/`):
//! - client → server: `subscribe {topic}`, `unsubscribe {topic}`,
//!   `snapshot {topic}`
//! - server → client: `snapshot.<topic>`, `event.<topic>`,
//!   `lagged.<topic>`, plus `error` for bad requests
//!
//! Every subscribe (and every reconnect-then-subscribe) answers with a
//! fresh snapshot; clients treat it as the new truth and discard cached
//! diffs.

pub mod snapshot;
pub mod ws;

use std::sync::Arc;

use vox_store::{CallStore, CampaignStore};

use crate::bus::EventBus;

/// Room name vocabulary. Mirrors the bus topics exactly.
pub fn is_valid_topic(topic: &str) -> bool {
    match topic {
        "call.updates" | "campaign.updates" => true,
        _ => {
            for prefix in ["call.", "transcript.", "campaign."] {
                if let Some(rest) = topic.strip_prefix(prefix) {
                    return !rest.is_empty() && !rest.contains(['.', ' ']);
                }
            }
            false
        }
    }
}

/// Shared dependencies for hub connections.
pub struct HubContext {
    pub calls: Arc<CallStore>,
    pub campaigns: Arc<CampaignStore>,
    pub bus: Arc<EventBus>,
}
