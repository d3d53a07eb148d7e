//! Point-in-time projections sent to a client on (re)subscribe.

use serde_json::{json, Value};
use uuid::Uuid;

use super::HubContext;

/// Build the snapshot for one topic. `None` means the referenced entity
/// does not exist (distinct from an empty room).
pub fn build(ctx: &HubContext, topic: &str) -> Option<Value> {
    match topic {
        "call.updates" => Some(json!({ "calls": ctx.calls.active_calls() })),
        "campaign.updates" => Some(json!({ "campaigns": ctx.campaigns.list() })),
        _ => {
            if let Some(sid) = topic.strip_prefix("call.") {
                let call = ctx.calls.get(sid)?;
                return Some(json!({
                    "call": call,
                    "events": ctx.calls.events(sid).unwrap_or_default(),
                }));
            }
            if let Some(sid) = topic.strip_prefix("transcript.") {
                return Some(json!({ "transcript": ctx.calls.transcript(sid)? }));
            }
            if let Some(id) = topic.strip_prefix("campaign.") {
                let id: Uuid = id.parse().ok()?;
                return Some(json!({ "campaign": ctx.campaigns.get(&id)? }));
            }
            None
        }
    }
}
