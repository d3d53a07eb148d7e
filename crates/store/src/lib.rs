//! Durable persistence for Voxflow.
//!
//! Each store keeps its working set in memory behind a lock and persists
//! to a JSON file under the configured state directory. All claim and
//! upsert operations run inside one lock acquisition, which makes them
//! linearizable against concurrent callers in this process, the only
//! writer there is.

pub mod calls;
pub mod campaigns;
pub mod contacts;

pub use calls::CallStore;
pub use campaigns::CampaignStore;
pub use contacts::ContactStore;

use std::path::Path;

use vox_domain::{Error, Result};

/// Read and deserialize a store file, tolerating absence (fresh state
/// dir) but surfacing unreadable/corrupt files as `Unavailable`.
pub(crate) fn load_json<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Unavailable(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::Unavailable(format!("{}: {e}", path.display())))
}

/// Serialize and write a store file off the async runtime. Failures are
/// logged, not surfaced; the in-memory copy stays authoritative and the
/// next flush retries.
pub(crate) async fn persist_json<T: serde::Serialize>(path: std::path::PathBuf, value: &T) {
    let json = match serde_json::to_string_pretty(value) {
        Ok(j) => j,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to serialize store");
            return;
        }
    };
    let _ = tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&path, json) {
            tracing::warn!(path = %path.display(), error = %e, "failed to persist store");
        }
    })
    .await;
}
