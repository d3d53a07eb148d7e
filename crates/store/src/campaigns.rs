//! Campaign store — CRUD plus closure-based atomic updates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use uuid::Uuid;

use vox_domain::model::{Campaign, CampaignState};
use vox_domain::Result;

pub struct CampaignStore {
    persist_path: PathBuf,
    inner: RwLock<HashMap<Uuid, Campaign>>,
}

impl CampaignStore {
    /// Load or create the store at `state_dir/campaigns.json`.
    pub fn new(state_dir: &Path) -> Result<Self> {
        let persist_path = state_dir.join("campaigns.json");
        let campaigns: Vec<Campaign> = crate::load_json(&persist_path)?;
        let map: HashMap<Uuid, Campaign> =
            campaigns.into_iter().map(|c| (c.id, c)).collect();
        tracing::info!(
            count = map.len(),
            path = %persist_path.display(),
            "campaign store loaded"
        );
        Ok(Self {
            persist_path,
            inner: RwLock::new(map),
        })
    }

    pub fn get(&self, id: &Uuid) -> Option<Campaign> {
        self.inner.read().get(id).cloned()
    }

    /// All campaigns, newest first.
    pub fn list(&self) -> Vec<Campaign> {
        let mut all: Vec<Campaign> = self.inner.read().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Campaigns currently in the given lifecycle state.
    pub fn list_in_state(&self, state: CampaignState) -> Vec<Campaign> {
        self.inner
            .read()
            .values()
            .filter(|c| c.state == state)
            .cloned()
            .collect()
    }

    pub async fn insert(&self, campaign: Campaign) -> Campaign {
        self.inner.write().insert(campaign.id, campaign.clone());
        self.persist().await;
        campaign
    }

    /// Apply `f` to the campaign under the write lock; returns the
    /// updated document. `updated_at` is bumped on every hit.
    pub async fn update<F>(&self, id: &Uuid, f: F) -> Option<Campaign>
    where
        F: FnOnce(&mut Campaign),
    {
        let updated = {
            let mut map = self.inner.write();
            let campaign = map.get_mut(id)?;
            f(campaign);
            campaign.updated_at = chrono::Utc::now();
            Some(campaign.clone())
        };
        if updated.is_some() {
            self.persist().await;
        }
        updated
    }

    pub async fn delete(&self, id: &Uuid) -> bool {
        let removed = self.inner.write().remove(id).is_some();
        if removed {
            self.persist().await;
        }
        removed
    }

    async fn persist(&self) {
        let campaigns: Vec<Campaign> = self.inner.read().values().cloned().collect();
        crate::persist_json(self.persist_path.clone(), &campaigns).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_domain::model::CampaignSettings;

    #[tokio::test]
    async fn crud_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CampaignStore::new(dir.path()).unwrap();

        let campaign = Campaign::new("Q3 outreach", CampaignSettings::default());
        let id = campaign.id;
        store.insert(campaign).await;

        assert_eq!(store.get(&id).unwrap().name, "Q3 outreach");
        assert_eq!(store.list().len(), 1);

        store
            .update(&id, |c| c.state = CampaignState::Active)
            .await
            .unwrap();
        assert_eq!(store.list_in_state(CampaignState::Active).len(), 1);

        assert!(store.delete(&id).await);
        assert!(store.get(&id).is_none());
    }

    #[tokio::test]
    async fn survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = CampaignStore::new(dir.path()).unwrap();
            let campaign = Campaign::new("persisted", CampaignSettings::default());
            let id = campaign.id;
            store.insert(campaign).await;
            id
        };
        let reloaded = CampaignStore::new(dir.path()).unwrap();
        assert_eq!(reloaded.get(&id).unwrap().name, "persisted");
    }

    #[tokio::test]
    async fn update_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CampaignStore::new(dir.path()).unwrap();
        assert!(store.update(&Uuid::new_v4(), |_| {}).await.is_none());
    }
}
