//! Contact store — phone-unique upserts and the atomic claim used by
//! the campaign engine.
//!
//! `claim_next` is the contended path: the whole select-and-mark runs
//! inside one write-lock acquisition, so concurrent claim loops can
//! never hand out the same contact twice.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use vox_domain::model::{Contact, ContactOutcome, ContactStatus};
use vox_domain::Result;

#[derive(Default)]
struct ContactsInner {
    by_id: HashMap<Uuid, Contact>,
    /// E.164 → id. Enforces the unique-phone invariant.
    by_phone: HashMap<String, Uuid>,
}

pub struct ContactStore {
    persist_path: PathBuf,
    inner: RwLock<ContactsInner>,
}

/// Outcome of a bulk add: how many rows were new vs. merged into an
/// existing contact by phone.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct BulkAddReport {
    pub added: usize,
    pub merged: usize,
}

impl ContactStore {
    /// Load or create the store at `state_dir/contacts.json`.
    pub fn new(state_dir: &Path) -> Result<Self> {
        let persist_path = state_dir.join("contacts.json");
        let contacts: Vec<Contact> = crate::load_json(&persist_path)?;
        let mut inner = ContactsInner::default();
        for contact in contacts {
            inner.by_phone.insert(contact.phone.clone(), contact.id);
            inner.by_id.insert(contact.id, contact);
        }
        tracing::info!(
            count = inner.by_id.len(),
            path = %persist_path.display(),
            "contact store loaded"
        );
        Ok(Self {
            persist_path,
            inner: RwLock::new(inner),
        })
    }

    pub fn get(&self, id: &Uuid) -> Option<Contact> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn get_by_phone(&self, phone: &str) -> Option<Contact> {
        let inner = self.inner.read();
        inner
            .by_phone
            .get(phone)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn list_for_campaign(&self, campaign_id: &Uuid) -> Vec<Contact> {
        self.inner
            .read()
            .by_id
            .values()
            .filter(|c| c.campaign_ids.contains(campaign_id))
            .cloned()
            .collect()
    }

    /// Contacts still eligible for a first dial in this campaign.
    pub fn pending_count(&self, campaign_id: &Uuid) -> usize {
        let now = Utc::now();
        self.inner
            .read()
            .by_id
            .values()
            .filter(|c| c.claimable(campaign_id, now))
            .count()
    }

    /// Add contacts to a campaign. Rows whose phone already exists are
    /// merged: the existing contact just gains the campaign membership.
    pub async fn add_to_campaign(
        &self,
        campaign_id: Uuid,
        contacts: Vec<Contact>,
    ) -> BulkAddReport {
        let mut report = BulkAddReport::default();
        {
            let mut inner = self.inner.write();
            for mut contact in contacts {
                match inner.by_phone.get(&contact.phone).copied() {
                    Some(existing_id) => {
                        if let Some(existing) = inner.by_id.get_mut(&existing_id) {
                            existing.campaign_ids.insert(campaign_id);
                            report.merged += 1;
                        }
                    }
                    None => {
                        contact.campaign_ids.insert(campaign_id);
                        inner.by_phone.insert(contact.phone.clone(), contact.id);
                        inner.by_id.insert(contact.id, contact);
                        report.added += 1;
                    }
                }
            }
        }
        self.persist().await;
        report
    }

    /// Atomically claim up to `n` dialable contacts for a campaign.
    ///
    /// Selection: `status = pending`, `call_count = 0`, campaign member,
    /// lock absent or expired. Order: priority descending, then
    /// `created_at` ascending as the tie-break. Claimed contacts move to
    /// `processing` with a lease of `lock_ttl` and their `call_count`
    /// bumped.
    pub async fn claim_next(
        &self,
        campaign_id: &Uuid,
        n: usize,
        lock_ttl: Duration,
    ) -> Vec<Contact> {
        if n == 0 {
            return Vec::new();
        }
        let now = Utc::now();
        let claimed = {
            let mut inner = self.inner.write();

            let mut eligible: Vec<(i32, DateTime<Utc>, Uuid)> = inner
                .by_id
                .values()
                .filter(|c| c.claimable(campaign_id, now))
                .map(|c| (c.priority, c.created_at, c.id))
                .collect();
            eligible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

            eligible
                .into_iter()
                .take(n)
                .filter_map(|(_, _, id)| {
                    let contact = inner.by_id.get_mut(&id)?;
                    contact.status = ContactStatus::Processing;
                    contact.locked_until = Some(now + lock_ttl);
                    contact.call_count += 1;
                    Some(contact.clone())
                })
                .collect::<Vec<_>>()
        };
        if !claimed.is_empty() {
            self.persist().await;
        }
        claimed
    }

    /// Settle a contact after its dial attempt reached a terminal state.
    pub async fn finalize(&self, contact_id: &Uuid, outcome: ContactOutcome) -> Option<Contact> {
        let finalized = {
            let mut inner = self.inner.write();
            let contact = inner.by_id.get_mut(contact_id)?;
            contact.locked_until = None;
            contact.last_contacted_at = Some(Utc::now());
            contact.status = match outcome {
                ContactOutcome::Called => ContactStatus::Called,
                ContactOutcome::Failed => ContactStatus::Failed,
            };
            Some(contact.clone())
        };
        if finalized.is_some() {
            self.persist().await;
        }
        finalized
    }

    /// Sweep `processing` contacts whose lease expired more than `grace`
    /// ago. A contact is only reverted when `in_flight` says no live
    /// call exists for it; the revert undoes the claim's `call_count`
    /// bump. Returns the number of contacts released.
    pub async fn release_expired(
        &self,
        grace: Duration,
        in_flight: &(dyn Fn(&Uuid) -> bool + Send + Sync),
    ) -> usize {
        let now = Utc::now();
        let released = {
            let mut inner = self.inner.write();
            let stale: Vec<Uuid> = inner
                .by_id
                .values()
                .filter(|c| {
                    c.status == ContactStatus::Processing
                        && c.locked_until.map_or(true, |t| t + grace < now)
                        && !in_flight(&c.id)
                })
                .map(|c| c.id)
                .collect();
            for id in &stale {
                if let Some(contact) = inner.by_id.get_mut(id) {
                    contact.status = ContactStatus::Pending;
                    contact.locked_until = None;
                    contact.call_count = contact.call_count.saturating_sub(1);
                }
            }
            stale.len()
        };
        if released > 0 {
            tracing::info!(released, "released expired contact locks");
            self.persist().await;
        }
        released
    }

    async fn persist(&self) {
        let contacts: Vec<Contact> = self.inner.read().by_id.values().cloned().collect();
        crate::persist_json(self.persist_path.clone(), &contacts).await;
    }
}
