//! Cached view of the active generation label.

use crate::error::MirrorResult;
use crate::metadata::MetadataStore;
use tokio::sync::RwLock;
use tracing::debug;

/// Active generation label, loaded from the metadata store on first use.
///
/// Shared between the synchronizer, which updates it right after a commit,
/// and the request interceptor, which reads it on every request.
#[derive(Debug, Default)]
pub struct ActiveGeneration {
    // Outer `None`: not loaded yet. Inner `None`: nothing installed.
    cached: RwLock<Option<Option<String>>>,
}

impl ActiveGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, store: &dyn MetadataStore) -> MirrorResult<Option<String>> {
        if let Some(label) = self.cached.read().await.as_ref() {
            return Ok(label.clone());
        }

        let mut cached = self.cached.write().await;
        if let Some(label) = cached.as_ref() {
            return Ok(label.clone());
        }
        debug!("Loading active generation from metadata store");
        let label = store.active_generation().await?;
        *cached = Some(label.clone());
        Ok(label)
    }

    /// Records the label a just-committed transaction made active.
    pub async fn set(&self, label: Option<String>) {
        *self.cached.write().await = Some(label);
    }

    /// Forces the next `get` to reload from the store.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}
