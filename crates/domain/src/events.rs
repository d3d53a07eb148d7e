//! Domain events published on the in-process bus and fanned out to
//! dashboard clients.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Call, Campaign, Recording, UtteranceRole};

/// Bus topic names. Dynamic per-entity topics are built from the static
/// prefixes so publishers and subscribers cannot drift.
pub mod topics {
    use uuid::Uuid;

    pub const CALL_UPDATES: &str = "call.updates";
    pub const CAMPAIGN_UPDATES: &str = "campaign.updates";

    pub fn call(sid: &str) -> String {
        format!("call.{sid}")
    }

    pub fn transcript(sid: &str) -> String {
        format!("transcript.{sid}")
    }

    pub fn campaign(id: &Uuid) -> String {
        format!("campaign.{id}")
    }
}

/// Everything that can cross the bus. Serialized as `{type, ...}` for
/// the real-time protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    CallUpdated {
        call: Call,
    },
    TranscriptDelta {
        call_sid: String,
        role: UtteranceRole,
        text: String,
        is_partial: bool,
    },
    CampaignUpdated {
        campaign: Campaign,
    },
    /// Lightweight per-tick progress line, cheaper than a full campaign
    /// document.
    CampaignProgress {
        campaign_id: Uuid,
        calls_placed: u64,
        calls_completed: u64,
        calls_failed: u64,
        in_flight: usize,
    },
    RecordingUpdated {
        recording: Recording,
    },
    QualityUpdate {
        call_sid: String,
        payload: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_builders() {
        assert_eq!(topics::call("CA1"), "call.CA1");
        assert_eq!(topics::transcript("CA1"), "transcript.CA1");
        let id = Uuid::nil();
        assert_eq!(topics::campaign(&id), format!("campaign.{id}"));
    }

    #[test]
    fn events_tag_by_type() {
        let ev = DomainEvent::TranscriptDelta {
            call_sid: "CA1".into(),
            role: UtteranceRole::Agent,
            text: "hello".into(),
            is_partial: true,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "transcript_delta");
        assert_eq!(json["is_partial"], true);
    }
}
