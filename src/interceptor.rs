//! Request interception: serving content from the active generation.
//!
//! A miss walks a ladder of increasingly expensive fixes: repair the single
//! file, then run a full synchronization pass, then give up with a
//! [`MirrorError::StorageInconsistency`].

use crate::error::{MirrorError, MirrorResult};
use crate::fetch::{fetch_bytes, FetchOptions};
use crate::orchestrator::CacheSynchronizer;
use crate::types::FileVersionRecord;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How a resolved request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveSource {
    /// Served straight from the active generation.
    Cache,
    /// The file was missing and a single-file fetch restored it.
    Repaired,
    /// The file was restored by a full synchronization pass.
    Resynced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Mirror path the request mapped to.
    pub path: String,
    pub body: Bytes,
    pub source: ResolveSource,
}

/// Answers content requests from the mirror.
pub struct RequestInterceptor {
    synchronizer: Arc<CacheSynchronizer>,
}

impl RequestInterceptor {
    pub fn new(synchronizer: Arc<CacheSynchronizer>) -> Self {
        Self { synchronizer }
    }

    pub fn synchronizer(&self) -> &Arc<CacheSynchronizer> {
        &self.synchronizer
    }

    /// Looks `path` up in the active generation.
    ///
    /// Returns [`MirrorError::NotFound`] when the path is not part of the
    /// mirrored set, and [`MirrorError::StorageInconsistency`] when it is
    /// but could not be restored.
    pub async fn resolve(&self, path: &str) -> MirrorResult<Resolved> {
        let start = Instant::now();
        let path = self.route(path);
        let sync = &self.synchronizer;

        let generation = match sync.active_generation().get(sync.metadata().as_ref()).await? {
            Some(generation) => generation,
            None => self.install_first(&path).await?,
        };
        let path = self.mirror_key(&path).await?;

        if let Some(body) = sync.blobs().get(&generation, &path).await? {
            debug!("fast path for {}: {:?}", path, start.elapsed());
            return Ok(Resolved {
                path,
                body,
                source: ResolveSource::Cache,
            });
        }

        warn!("File {} not in generation {}", path, generation);
        let record = match sync.metadata().file_record(&path).await? {
            Some(record) => record,
            None => return Err(MirrorError::NotFound(path)),
        };

        match self.repair(&generation, &record).await {
            Ok(body) => {
                info!("Repaired {} in generation {}", path, generation);
                return Ok(Resolved {
                    path,
                    body,
                    source: ResolveSource::Repaired,
                });
            }
            Err(e) => warn!("Repair of {} failed: {}; escalating to a full pass", path, e),
        }

        let escalation = sync.synchronize_or_heal().await;
        if let Err(e) = &escalation {
            warn!("Full pass for {} failed: {}", path, e);
        }

        // The pass may have installed a different generation.
        let generation = sync.active_generation().get(sync.metadata().as_ref()).await?;
        if let Some(generation) = generation.as_deref() {
            if let Some(body) = sync.blobs().get(generation, &path).await? {
                return Ok(Resolved {
                    path,
                    body,
                    source: ResolveSource::Resynced,
                });
            }
        }

        if escalation.is_ok() && sync.metadata().file_record(&path).await?.is_none() {
            return Err(MirrorError::NotFound(path));
        }
        Err(MirrorError::StorageInconsistency(match escalation {
            Ok(_) => format!("{} is recorded as cached but could not be restored", path),
            Err(e) => format!("{} is recorded as cached but could not be restored: {}", path, e),
        }))
    }

    /// Maps the mirror root to the configured index file.
    fn route(&self, path: &str) -> String {
        let is_root = matches!(path, "" | "/" | "./" | ".");
        match (&self.synchronizer.config().index_file, is_root) {
            (Some(index), true) => index.clone(),
            _ => path.to_string(),
        }
    }

    /// Spells `path` the way the manifest does, so `index.html`, `/index.html`
    /// and `./index.html` all address the same record and blob.
    async fn mirror_key(&self, path: &str) -> MirrorResult<String> {
        let bare = path.trim_start_matches("./").trim_start_matches('/');
        let mut candidates = vec![path.to_string()];
        for alias in [format!("./{}", bare), bare.to_string()] {
            if !candidates.contains(&alias) {
                candidates.push(alias);
            }
        }

        for candidate in &candidates {
            if self
                .synchronizer
                .metadata()
                .file_record(candidate)
                .await?
                .is_some()
            {
                return Ok(candidate.clone());
            }
        }
        Ok(path.to_string())
    }

    async fn install_first(&self, path: &str) -> MirrorResult<String> {
        info!("No generation installed while resolving {}; synchronizing", path);
        let sync = &self.synchronizer;
        sync.synchronize().await?;
        sync.active_generation()
            .get(sync.metadata().as_ref())
            .await?
            .ok_or_else(|| {
                MirrorError::StorageInconsistency(
                    "synchronization finished without an active generation".to_string(),
                )
            })
    }

    async fn repair(&self, generation: &str, record: &FileVersionRecord) -> MirrorResult<Bytes> {
        let sync = &self.synchronizer;
        let url = sync.config().file_url(generation, &record.url);
        info!(
            "Repairing {} ({}) from {}",
            record.url, record.content_version, url
        );

        let body = fetch_bytes(sync.fetcher().as_ref(), &url, FetchOptions::default(), None).await?;
        sync.blobs().put(generation, &record.url, body.clone()).await?;
        Ok(body)
    }
}
