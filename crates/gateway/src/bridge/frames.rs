//! Media-stream wire types and the bounded outbound frame queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound (telephony → bridge)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct StartFrame {
    #[serde(rename = "callSid")]
    pub call_sid: String,
    #[serde(rename = "streamSid", default)]
    pub stream_sid: Option<String>,
    #[serde(rename = "customParameters", default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaFrame {
    /// Base64 8 kHz µ-law, forwarded opaquely.
    pub payload: String,
    #[serde(default)]
    pub track: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamInbound {
    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        start: StartFrame,
    },
    Media {
        media: MediaFrame,
    },
    Stop {
        #[serde(default)]
        stop: serde_json::Value,
    },
    /// `connected`, `mark`, `dtmf`: nothing the bridge acts on.
    #[serde(other)]
    Other,
}

impl StreamInbound {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// The overrides the gateway threaded through the provider's TwiML.
#[derive(Debug, Clone, Default)]
pub struct StreamParams {
    pub prompt: Option<String>,
    pub first_message: Option<String>,
    pub name: Option<String>,
    pub campaign_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
}

impl StreamParams {
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let non_empty = |key: &str| map.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            prompt: non_empty("prompt"),
            first_message: non_empty("first_message"),
            name: non_empty("name"),
            campaign_id: non_empty("campaignId").and_then(|v| v.parse().ok()),
            contact_id: non_empty("contactId").and_then(|v| v.parse().ok()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound (bridge → telephony)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn media_frame(stream_sid: &str, payload_b64: &str) -> String {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": payload_b64 },
    })
    .to_string()
}

/// Tell the provider to flush buffered audio (sent on interruption).
pub fn clear_frame(stream_sid: &str) -> String {
    json!({ "event": "clear", "streamSid": stream_sid }).to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// ~5 s of 20 ms frames.
pub const FRAME_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// First drop of an overflow burst; worth a quality event.
    BurstStarted,
    /// Continuing an in-progress burst; dropped quietly.
    DroppedOldest,
}

/// Bounded FIFO between the AI-read loop and the telephony writer.
/// When the writer cannot keep up, the oldest audio is discarded so the
/// caller hears current speech after the stall instead of a replay.
pub struct FrameQueue {
    inner: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    overflowing: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            overflowing: AtomicBool::new(false),
        }
    }

    pub fn push(&self, frame: String) -> PushOutcome {
        let outcome = {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                queue.push_back(frame);
                if self.overflowing.swap(true, Ordering::AcqRel) {
                    PushOutcome::DroppedOldest
                } else {
                    PushOutcome::BurstStarted
                }
            } else {
                queue.push_back(frame);
                PushOutcome::Queued
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Drop everything queued and enqueue `frame` alone. Used for the
    /// `clear` frame on interruption; stale audio must not play out.
    pub fn flush_and_push(&self, frame: String) {
        {
            let mut queue = self.inner.lock();
            queue.clear();
            queue.push_back(frame);
        }
        self.overflowing.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Await the next frame; `None` once closed and drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.inner.lock();
                if let Some(frame) = queue.pop_front() {
                    if queue.len() < self.capacity / 2 {
                        self.overflowing.store(false, Ordering::Release);
                    }
                    // Wake the next waiter if frames remain.
                    if !queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(frame);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_with_custom_parameters() {
        let raw = r#"{
            "event": "start",
            "streamSid": "MZ1",
            "start": {
                "callSid": "CA1",
                "customParameters": {
                    "prompt": "Be brief.",
                    "name": "Ada",
                    "campaignId": "00000000-0000-0000-0000-000000000001",
                    "contactId": ""
                }
            }
        }"#;
        match StreamInbound::parse(raw) {
            Some(StreamInbound::Start { stream_sid, start }) => {
                assert_eq!(stream_sid.as_deref(), Some("MZ1"));
                assert_eq!(start.call_sid, "CA1");
                let params = StreamParams::from_map(&start.custom_parameters);
                assert_eq!(params.prompt.as_deref(), Some("Be brief."));
                assert_eq!(params.name.as_deref(), Some("Ada"));
                assert!(params.campaign_id.is_some());
                // Empty strings do not parse into ids.
                assert!(params.contact_id.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_events_fold_to_other() {
        assert!(matches!(
            StreamInbound::parse(r#"{"event":"connected","protocol":"Call"}"#),
            Some(StreamInbound::Other)
        ));
        assert!(matches!(
            StreamInbound::parse(r#"{"event":"mark","mark":{"name":"x"}}"#),
            Some(StreamInbound::Other)
        ));
    }

    #[test]
    fn outbound_frames_match_provider_shape() {
        let media: serde_json::Value =
            serde_json::from_str(&media_frame("MZ1", "AAAA")).unwrap();
        assert_eq!(media["event"], "media");
        assert_eq!(media["streamSid"], "MZ1");
        assert_eq!(media["media"]["payload"], "AAAA");

        let clear: serde_json::Value = serde_json::from_str(&clear_frame("MZ1")).unwrap();
        assert_eq!(clear["event"], "clear");
    }

    #[tokio::test]
    async fn queue_drops_oldest_on_overflow() {
        let queue = FrameQueue::new(3);
        assert_eq!(queue.push("a".into()), PushOutcome::Queued);
        assert_eq!(queue.push("b".into()), PushOutcome::Queued);
        assert_eq!(queue.push("c".into()), PushOutcome::Queued);
        // Overflow: "a" falls off, burst starts once.
        assert_eq!(queue.push("d".into()), PushOutcome::BurstStarted);
        assert_eq!(queue.push("e".into()), PushOutcome::DroppedOldest);

        assert_eq!(queue.pop().await.as_deref(), Some("c"));
        assert_eq!(queue.pop().await.as_deref(), Some("d"));
        assert_eq!(queue.pop().await.as_deref(), Some("e"));
    }

    #[tokio::test]
    async fn flush_and_push_jumps_the_line() {
        let queue = FrameQueue::new(8);
        queue.push("stale-1".into());
        queue.push("stale-2".into());
        queue.flush_and_push("clear".into());
        assert_eq!(queue.pop().await.as_deref(), Some("clear"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pop_returns_none_after_close() {
        let queue = FrameQueue::new(4);
        queue.push("last".into());
        queue.close();
        assert_eq!(queue.pop().await.as_deref(), Some("last"));
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(FrameQueue::new(4));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push("hello".into());
        assert_eq!(popper.await.unwrap().as_deref(), Some("hello"));
    }
}
