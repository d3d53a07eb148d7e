//! In-process event bus.
//!
//! Static topics (`call.updates`, `campaign.updates`) each own a
//! broadcast channel; per-entity topics (`call.<sid>`,
//! `transcript.<sid>`, `campaign.<id>`) are created lazily on first
//! subscribe and pruned once receiver-less. Publishers never block: a
//! slow subscriber's oldest messages fall off the broadcast ring and
//! surface as `RecvError::Lagged` on its side.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use vox_domain::events::{topics, DomainEvent};
use vox_domain::model::Call;

/// Ring size per subscriber. Roughly a minute of chatty-call traffic.
const TOPIC_CAPACITY: usize = 256;

pub struct EventBus {
    call_updates: broadcast::Sender<DomainEvent>,
    campaign_updates: broadcast::Sender<DomainEvent>,
    dynamic: RwLock<HashMap<String, broadcast::Sender<DomainEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (call_updates, _) = broadcast::channel(TOPIC_CAPACITY);
        let (campaign_updates, _) = broadcast::channel(TOPIC_CAPACITY);
        Self {
            call_updates,
            campaign_updates,
            dynamic: RwLock::new(HashMap::new()),
        }
    }

    /// Publish to one topic. Events on dynamic topics nobody watches are
    /// dropped; recovery is by snapshot, not replay.
    pub fn publish(&self, topic: &str, event: DomainEvent) {
        match topic {
            topics::CALL_UPDATES => {
                let _ = self.call_updates.send(event);
            }
            topics::CAMPAIGN_UPDATES => {
                let _ = self.campaign_updates.send(event);
            }
            _ => {
                let mut dynamic = self.dynamic.write();
                if let Some(sender) = dynamic.get(topic) {
                    if sender.send(event).is_err() {
                        // Last receiver is gone; drop the topic.
                        dynamic.remove(topic);
                    }
                }
            }
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<DomainEvent> {
        match topic {
            topics::CALL_UPDATES => self.call_updates.subscribe(),
            topics::CAMPAIGN_UPDATES => self.campaign_updates.subscribe(),
            _ => self
                .dynamic
                .write()
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
                .subscribe(),
        }
    }

    /// Fan a call document out to both its rooms.
    pub fn publish_call(&self, call: &Call) {
        let event = DomainEvent::CallUpdated { call: call.clone() };
        self.publish(&topics::call(&call.sid), event.clone());
        self.publish(topics::CALL_UPDATES, event);
    }

    /// Dynamic topics currently held open by at least one subscriber.
    pub fn open_dynamic_topics(&self) -> usize {
        self.dynamic.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_domain::model::UtteranceRole;

    fn delta(text: &str) -> DomainEvent {
        DomainEvent::TranscriptDelta {
            call_sid: "CA1".into(),
            role: UtteranceRole::User,
            text: text.into(),
            is_partial: false,
        }
    }

    #[tokio::test]
    async fn per_topic_fifo_per_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("transcript.CA1");
        for i in 0..5 {
            bus.publish("transcript.CA1", delta(&format!("m{i}")));
        }
        for i in 0..5 {
            match rx.recv().await.unwrap() {
                DomainEvent::TranscriptDelta { text, .. } => {
                    assert_eq!(text, format!("m{i}"));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_dropped() {
        let bus = EventBus::new();
        // No receiver on this dynamic topic: nothing to assert beyond
        // "does not block or panic".
        bus.publish("transcript.CA9", delta("lost"));
        assert_eq!(bus.open_dynamic_topics(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag_not_blockage() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("call.CA1");
        for i in 0..(TOPIC_CAPACITY + 50) {
            bus.publish("call.CA1", delta(&format!("m{i}")));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 50),
            other => panic!("expected lag, got {other:?}"),
        }
        // After the lag marker the subscriber resumes at the oldest
        // retained message.
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn dynamic_topic_pruned_after_last_receiver_drops() {
        let bus = EventBus::new();
        let rx = bus.subscribe("call.CA2");
        assert_eq!(bus.open_dynamic_topics(), 1);
        drop(rx);
        bus.publish("call.CA2", delta("x"));
        assert_eq!(bus.open_dynamic_topics(), 0);
    }
}
