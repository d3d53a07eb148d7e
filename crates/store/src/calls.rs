//! Call store — calls plus their append-only event log, transcript and
//! recordings.
//!
//! This is the high-churn store (every audio-quality blip and transcript
//! delta lands here), so it batches writes behind a dirty flag and a
//! periodic `flush_if_dirty` instead of persisting per mutation.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use vox_domain::model::{
    Call, CallEvent, CallSid, Recording, Transcript, TranscriptAnalysis, Utterance,
};
use vox_domain::{Error, Result};

/// How many recent event hashes to keep per call for idempotent appends.
const DEDUPE_WINDOW: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call: Call,
    #[serde(default)]
    pub events: Vec<CallEvent>,
    #[serde(default)]
    pub transcript: Transcript,
    #[serde(default)]
    pub recordings: HashMap<String, Recording>,
    /// Rolling hashes of recent event payloads, rebuilt on load.
    #[serde(skip)]
    recent_hashes: VecDeque<String>,
}

impl CallRecord {
    fn new(call: Call) -> Self {
        Self {
            call,
            events: Vec::new(),
            transcript: Transcript::default(),
            recordings: HashMap::new(),
            recent_hashes: VecDeque::new(),
        }
    }
}

#[derive(Default)]
struct CallsInner {
    by_sid: HashMap<CallSid, CallRecord>,
    /// recording sid → call sid, for the recording lookup endpoints.
    recording_index: HashMap<String, CallSid>,
}

pub struct CallStore {
    persist_path: PathBuf,
    inner: RwLock<CallsInner>,
    dirty: AtomicBool,
}

fn event_hash(event: &CallEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&event.event_type).unwrap_or_default());
    hasher.update(event.payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

impl CallStore {
    /// Load or create the store at `state_dir/calls.json`.
    pub fn new(state_dir: &Path) -> Result<Self> {
        let persist_path = state_dir.join("calls.json");
        let records: Vec<CallRecord> = crate::load_json(&persist_path)?;
        let mut inner = CallsInner::default();
        for mut record in records {
            record.recent_hashes = record
                .events
                .iter()
                .rev()
                .take(DEDUPE_WINDOW)
                .map(event_hash)
                .collect();
            for sid in record.recordings.keys() {
                inner
                    .recording_index
                    .insert(sid.clone(), record.call.sid.clone());
            }
            inner.by_sid.insert(record.call.sid.clone(), record);
        }
        tracing::info!(
            count = inner.by_sid.len(),
            path = %persist_path.display(),
            "call store loaded"
        );
        Ok(Self {
            persist_path,
            inner: RwLock::new(inner),
            dirty: AtomicBool::new(false),
        })
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    // ── Calls ────────────────────────────────────────────────────────

    pub fn get(&self, sid: &str) -> Option<Call> {
        self.inner.read().by_sid.get(sid).map(|r| r.call.clone())
    }

    pub fn upsert_call(&self, call: Call) {
        let mut inner = self.inner.write();
        inner
            .by_sid
            .entry(call.sid.clone())
            .and_modify(|r| r.call = call.clone())
            .or_insert_with(|| CallRecord::new(call));
        drop(inner);
        self.mark_dirty();
    }

    /// Apply `f` to the call under the write lock. The closure runs
    /// atomically with respect to every other store operation, which is
    /// what the termination arbiter leans on for its write-once rule.
    pub fn update_call<F, T>(&self, sid: &str, f: F) -> Option<T>
    where
        F: FnOnce(&mut Call) -> T,
    {
        let out = {
            let mut inner = self.inner.write();
            let record = inner.by_sid.get_mut(sid)?;
            Some(f(&mut record.call))
        };
        if out.is_some() {
            self.mark_dirty();
        }
        out
    }

    /// All calls in a non-terminal state, oldest first. Snapshot source
    /// for the `call.updates` room.
    pub fn active_calls(&self) -> Vec<Call> {
        let mut calls: Vec<Call> = self
            .inner
            .read()
            .by_sid
            .values()
            .filter(|r| !r.call.is_terminal())
            .map(|r| r.call.clone())
            .collect();
        calls.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        calls
    }

    /// Reverse lookup for the AI post-call webhook, which only knows
    /// the conversation id.
    pub fn find_by_conversation_id(&self, conversation_id: &str) -> Option<Call> {
        self.inner
            .read()
            .by_sid
            .values()
            .find(|r| r.call.conversation_id.as_deref() == Some(conversation_id))
            .map(|r| r.call.clone())
    }

    /// Non-terminal call existence per contact, used by the lock sweeper.
    pub fn has_live_call_for_contact(&self, contact_id: &Uuid) -> bool {
        self.inner
            .read()
            .by_sid
            .values()
            .any(|r| !r.call.is_terminal() && r.call.contact_id == Some(*contact_id))
    }

    /// Calls filtered and paginated, newest first.
    pub fn list(
        &self,
        campaign_id: Option<Uuid>,
        contact_id: Option<Uuid>,
        limit: usize,
        offset: usize,
    ) -> Vec<Call> {
        let mut calls: Vec<Call> = self
            .inner
            .read()
            .by_sid
            .values()
            .map(|r| r.call.clone())
            .filter(|c| campaign_id.map_or(true, |id| c.campaign_id == Some(id)))
            .filter(|c| contact_id.map_or(true, |id| c.contact_id == Some(id)))
            .collect();
        calls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        calls.into_iter().skip(offset).take(limit).collect()
    }

    // ── Events ───────────────────────────────────────────────────────

    /// Append an event to the call's log. Duplicate payloads inside the
    /// dedupe window are dropped (idempotent webhook retries); event
    /// timestamps are clamped so the per-call log stays non-decreasing.
    /// Returns whether the event was actually appended.
    pub fn append_event(&self, mut event: CallEvent) -> Result<bool> {
        let appended = {
            let mut inner = self.inner.write();
            let record = inner
                .by_sid
                .get_mut(&event.call_sid)
                .ok_or_else(|| Error::NotFound(format!("call {}", event.call_sid)))?;

            let hash = event_hash(&event);
            if record.recent_hashes.contains(&hash) {
                return Ok(false);
            }
            if let Some(last) = record.events.last() {
                if event.timestamp < last.timestamp {
                    event.timestamp = last.timestamp;
                }
            }
            record.recent_hashes.push_back(hash);
            if record.recent_hashes.len() > DEDUPE_WINDOW {
                record.recent_hashes.pop_front();
            }
            record.events.push(event);
            true
        };
        if appended {
            self.mark_dirty();
        }
        Ok(appended)
    }

    pub fn events(&self, sid: &str) -> Option<Vec<CallEvent>> {
        self.inner.read().by_sid.get(sid).map(|r| r.events.clone())
    }

    // ── Transcript ───────────────────────────────────────────────────

    /// Append one utterance. Rejected once the transcript is frozen
    /// (post-call analysis applied).
    pub fn append_utterance(&self, sid: &str, utterance: Utterance) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let record = inner
                .by_sid
                .get_mut(sid)
                .ok_or_else(|| Error::NotFound(format!("call {sid}")))?;
            if record.transcript.frozen {
                return Err(Error::Conflict(format!("transcript for {sid} is frozen")));
            }
            record.transcript.utterances.push(utterance);
        }
        self.mark_dirty();
        Ok(())
    }

    /// Replace the trailing utterance for `role` when the AI sends a
    /// partial correction; appends when there is nothing to correct.
    pub fn correct_last_utterance(&self, sid: &str, utterance: Utterance) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let record = inner
                .by_sid
                .get_mut(sid)
                .ok_or_else(|| Error::NotFound(format!("call {sid}")))?;
            if record.transcript.frozen {
                return Err(Error::Conflict(format!("transcript for {sid} is frozen")));
            }
            match record
                .transcript
                .utterances
                .last_mut()
                .filter(|u| u.role == utterance.role)
            {
                Some(last) => *last = utterance,
                None => record.transcript.utterances.push(utterance),
            }
        }
        self.mark_dirty();
        Ok(())
    }

    /// Attach the post-call analysis and freeze the transcript.
    pub fn apply_analysis(&self, sid: &str, analysis: TranscriptAnalysis) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let record = inner
                .by_sid
                .get_mut(sid)
                .ok_or_else(|| Error::NotFound(format!("call {sid}")))?;
            record.transcript.analysis = Some(analysis);
            record.transcript.frozen = true;
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn transcript(&self, sid: &str) -> Option<Transcript> {
        self.inner
            .read()
            .by_sid
            .get(sid)
            .map(|r| r.transcript.clone())
    }

    // ── Recordings ───────────────────────────────────────────────────

    pub fn upsert_recording(&self, recording: Recording) {
        let mut inner = self.inner.write();
        inner
            .recording_index
            .insert(recording.sid.clone(), recording.call_sid.clone());
        if let Some(record) = inner.by_sid.get_mut(&recording.call_sid) {
            if !record.call.recording_sids.contains(&recording.sid) {
                record.call.recording_sids.push(recording.sid.clone());
            }
            record.recordings.insert(recording.sid.clone(), recording);
        }
        drop(inner);
        self.mark_dirty();
    }

    pub fn recording(&self, recording_sid: &str) -> Option<Recording> {
        let inner = self.inner.read();
        let call_sid = inner.recording_index.get(recording_sid)?;
        inner
            .by_sid
            .get(call_sid)?
            .recordings
            .get(recording_sid)
            .cloned()
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Write the store out if anything changed since the last flush.
    pub async fn flush_if_dirty(&self) {
        if self.dirty.swap(false, Ordering::AcqRel) {
            let records: Vec<CallRecord> =
                self.inner.read().by_sid.values().cloned().collect();
            crate::persist_json(self.persist_path.clone(), &records).await;
        }
    }
}
