//! Main orchestration logic for checking and synchronizing the mirror.
//!
//! A synchronization builds the new generation next to the active one and
//! makes it authoritative with a single metadata transaction. Nothing a
//! reader can observe changes before that commit; the previous generation
//! is deleted only after it.

use crate::blob::BlobStore;
use crate::error::{MirrorError, MirrorResult};
use crate::fetch::{fetch_bytes, FetchOptions, Fetcher};
use crate::generation::ActiveGeneration;
use crate::manifest::decode_stream;
use crate::metadata::{MetadataKey, MetadataStore, Transaction, UpdateInfo};
use crate::notify::{Notification, NotificationChannel, UpdateStatus};
use crate::reconcile::{diff, Reconciliation};
use crate::types::{FileEntry, FileVersionRecord, Manifest, MirrorConfig, SyncPhase};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio_retry2::{Retry, RetryError};
use tracing::{error, info, warn};

/// What a synchronization pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Generation active before the pass.
    pub previous: Option<String>,
    /// Generation active after the pass.
    pub version: String,
    /// Files fetched from the network.
    pub fetched: Vec<String>,
    /// Files copied forward from the previous generation.
    pub copied: Vec<String>,
    /// Files no longer listed upstream whose records were dropped.
    pub removed: Vec<String>,
    pub bytes_fetched: u64,
}

/// Result of [`CacheSynchronizer::synchronize`] and friends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum SyncOutcome {
    /// Upstream matches the active generation; nothing was touched.
    NoUpdateNeeded { version: String },
    /// A new generation was built and committed.
    Installed(SyncReport),
    /// Missing blobs of the active generation were restored in place.
    Healed(SyncReport),
}

impl SyncOutcome {
    pub fn version(&self) -> &str {
        match self {
            SyncOutcome::NoUpdateNeeded { version } => version,
            SyncOutcome::Installed(report) | SyncOutcome::Healed(report) => &report.version,
        }
    }

    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::NoUpdateNeeded { .. } => None,
            SyncOutcome::Installed(report) | SyncOutcome::Healed(report) => Some(report),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassMode {
    /// Install a new generation if upstream moved, otherwise do nothing.
    Update,
    /// Like `Update`, but restore missing blobs when upstream did not move.
    UpdateOrHeal,
}

/// Fetches, reconciles and installs generations of the mirror.
///
/// All mutating operations are serialized by a per-instance lock, so at most
/// one pass writes to the stores at a time.
pub struct CacheSynchronizer {
    config: MirrorConfig,
    fetcher: Arc<dyn Fetcher>,
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    active: Arc<ActiveGeneration>,
    notifications: NotificationChannel,
    progress: indicatif::ProgressBar,
    phase: watch::Sender<SyncPhase>,
    lock: Mutex<()>,
}

impl CacheSynchronizer {
    pub fn new(
        config: MirrorConfig,
        fetcher: Arc<dyn Fetcher>,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            config,
            fetcher,
            metadata,
            blobs,
            active: Arc::new(ActiveGeneration::new()),
            notifications: NotificationChannel::new(),
            progress: indicatif::ProgressBar::hidden(),
            phase,
            lock: Mutex::new(()),
        }
    }

    pub fn with_notifications(mut self, notifications: NotificationChannel) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_active_generation(mut self, active: Arc<ActiveGeneration>) -> Self {
        self.active = active;
        self
    }

    /// Reports download progress on `progress` instead of a hidden bar.
    pub fn with_progress_bar(mut self, progress: indicatif::ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn active_generation(&self) -> &Arc<ActiveGeneration> {
        &self.active
    }

    pub fn notifications(&self) -> &NotificationChannel {
        &self.notifications
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Retrieves and decodes the upstream manifest, bypassing caches.
    pub async fn fetch_manifest(&self) -> MirrorResult<Manifest> {
        let url = self.config.manifest_url();
        info!("Retrieving manifest from {}", url);

        let start = Instant::now();
        let stream = self.fetcher.fetch(&url, FetchOptions::bypass_cache()).await?;
        let manifest = decode_stream(stream).await?;
        info!("Manifest fetched and decoded in {:?}", start.elapsed());
        Ok(manifest)
    }

    /// Fetches the manifest and records what it says about available updates.
    ///
    /// Only the update bookkeeping keys are written; the active generation
    /// and the file records are untouched.
    pub async fn check_for_updates(&self) -> MirrorResult<UpdateInfo> {
        let _guard = self.lock.lock().await;

        let manifest = self.fetch_manifest().await?;
        let current = self.metadata.active_generation().await?;
        let update_available = current.as_deref() != Some(manifest.app_version.as_str());
        let checked = now_rfc3339();

        let mut txn = Transaction::new();
        txn.put(MetadataKey::LastChecked, checked.clone())
            .put(MetadataKey::UpdateAvailable, update_available)
            .put(MetadataKey::UpdateSizeEstimate, manifest.total_size())
            .put(MetadataKey::UpstreamVersion, manifest.app_version.clone());
        self.metadata.commit(txn).await?;

        info!(
            "Local version: {} / upstream version: {}",
            current.as_deref().unwrap_or("<none>"),
            manifest.app_version
        );
        self.notifications.notify(Notification::UpdateInfo {
            status: if update_available {
                UpdateStatus::Available
            } else {
                UpdateStatus::UpToDate
            },
            date_checked: Some(checked.clone()),
            update_size: Some(manifest.total_size()),
            new_version: Some(manifest.app_version.clone()),
            current_version: current.clone(),
        });

        Ok(UpdateInfo {
            update_available,
            last_checked: Some(checked),
            update_size: Some(manifest.total_size()),
            upstream_version: Some(manifest.app_version),
            current_version: current,
        })
    }

    /// Performs one reconciliation-and-update pass.
    ///
    /// Returns [`SyncOutcome::NoUpdateNeeded`] without mutating anything when
    /// upstream matches the active generation. On failure before the commit
    /// the active generation and its records are left exactly as they were.
    pub async fn synchronize(&self) -> MirrorResult<SyncOutcome> {
        let _guard = self.lock.lock().await;
        self.run_pass(PassMode::Update).await
    }

    /// Like [`synchronize`](Self::synchronize), but when upstream has not
    /// moved, restores any file of the active generation missing from the
    /// blob store.
    pub async fn synchronize_or_heal(&self) -> MirrorResult<SyncOutcome> {
        let _guard = self.lock.lock().await;
        self.run_pass(PassMode::UpdateOrHeal).await
    }

    /// Retries whole [`synchronize`](Self::synchronize) attempts on transport
    /// errors, up to `sync_attempts` attempts in total.
    pub async fn synchronize_with_retry(&self) -> MirrorResult<SyncOutcome> {
        let retries = self.config.sync_attempts.saturating_sub(1);
        let retry_strategy =
            tokio_retry2::strategy::FixedInterval::from_millis(self.config.retry_interval_ms)
                .take(retries);

        Retry::spawn(retry_strategy, || async move {
            match self.synchronize().await {
                Ok(outcome) => Ok(outcome),
                Err(e) if e.is_transport() => {
                    warn!("Synchronization attempt failed due to error: {}", e);
                    RetryError::to_transient(e)
                }
                Err(e) => RetryError::to_permanent(e),
            }
        })
        .await
    }

    /// Installs the newest version if nothing is installed yet, otherwise
    /// only checks for updates.
    pub async fn bootstrap(&self) -> MirrorResult<()> {
        if self.metadata.active_generation().await?.is_some() {
            self.check_for_updates().await?;
        } else {
            self.synchronize().await?;
        }
        Ok(())
    }

    /// Drops the installed mirror and installs the newest version from scratch.
    ///
    /// Unlike [`synchronize`](Self::synchronize) this gives up the offline
    /// copy before the download starts: if the download fails, nothing is
    /// installed afterwards.
    pub async fn reinstall(&self) -> MirrorResult<SyncOutcome> {
        let _guard = self.lock.lock().await;

        let previous = self.metadata.active_generation().await?;
        let records = self.metadata.file_records().await?;
        let mut txn = Transaction::new();
        txn.delete(MetadataKey::ActiveGeneration);
        for record in &records {
            txn.delete(MetadataKey::file(record.url.clone()));
        }
        self.metadata.commit(txn).await?;
        self.active.set(None).await;
        info!(
            "Cleared active generation {} and {} record(s) for reinstall",
            previous.as_deref().unwrap_or("<none>"),
            records.len()
        );

        if let Some(previous) = previous {
            if let Err(e) = self.blobs.delete_generation(&previous).await {
                warn!("Failed to delete generation {}: {}", previous, e);
            }
        }

        self.run_pass(PassMode::Update).await
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }

    fn fail(&self, e: MirrorError) -> MirrorError {
        error!("Synchronization failed: {}", e);
        self.set_phase(SyncPhase::Failed);
        e
    }

    async fn run_pass(&self, mode: PassMode) -> MirrorResult<SyncOutcome> {
        let start = Instant::now();
        self.set_phase(SyncPhase::Checking);
        self.notifications
            .notify(Notification::status("Updating version info..."));

        let manifest = match self.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => return Err(self.fail(e)),
        };
        let (previous, records) = match self.local_state().await {
            Ok(state) => state,
            Err(e) => return Err(self.fail(e)),
        };

        if previous.as_deref() == Some(manifest.app_version.as_str()) {
            if mode == PassMode::UpdateOrHeal {
                return match self.heal(&manifest, &records).await {
                    Ok(outcome) => {
                        self.set_phase(SyncPhase::Idle);
                        Ok(outcome)
                    }
                    Err(e) => Err(self.fail(e)),
                };
            }

            info!("Versions match ({}), nothing to do", manifest.app_version);
            self.set_phase(SyncPhase::NoUpdateNeeded);
            self.notifications
                .notify(Notification::status("Local version is already up to date."));
            self.set_phase(SyncPhase::Idle);
            return Ok(SyncOutcome::NoUpdateNeeded {
                version: manifest.app_version,
            });
        }

        info!(
            "Version mismatch ({} -> {}), updating",
            previous.as_deref().unwrap_or("<none>"),
            manifest.app_version
        );
        let reconciliation = diff(&manifest, &records, previous.as_deref());
        let outcome = self.install(&reconciliation, &records).await;
        info!("Synchronization pass took {:?}", start.elapsed());
        outcome
    }

    async fn local_state(&self) -> MirrorResult<(Option<String>, Vec<FileVersionRecord>)> {
        let previous = self.metadata.active_generation().await?;
        let records = self.metadata.file_records().await?;
        Ok((previous, records))
    }

    async fn install(
        &self,
        reconciliation: &Reconciliation,
        records: &[FileVersionRecord],
    ) -> MirrorResult<SyncOutcome> {
        let version = reconciliation.upstream_app_version.as_str();
        let previous = reconciliation.local_generation.clone();

        self.set_phase(SyncPhase::Downloading);
        self.notifications
            .notify(Notification::status("Downloading files..."));

        let (fetched, copied, bytes_fetched) =
            match self.build_generation(reconciliation).await {
                Ok(built) => built,
                Err(e) => {
                    self.discard_generation(version).await;
                    return Err(self.fail(e));
                }
            };

        self.set_phase(SyncPhase::Committing);
        let removed: Vec<String> = reconciliation
            .removed(records)
            .into_iter()
            .map(|r| r.url.clone())
            .collect();

        let mut txn = Transaction::new();
        for entry in reconciliation.to_fetch() {
            txn.put_record(&FileVersionRecord::from(entry));
        }
        for url in &removed {
            txn.delete(MetadataKey::file(url.clone()));
        }
        txn.put(MetadataKey::ActiveGeneration, version)
            .put(MetadataKey::UpstreamVersion, version)
            .put(MetadataKey::UpdateAvailable, false)
            .put(MetadataKey::LastChecked, now_rfc3339());

        if let Err(e) = self.metadata.commit(txn).await {
            self.discard_generation(version).await;
            return Err(self.fail(e));
        }
        self.active.set(Some(version.to_string())).await;
        info!("Generation {} is now active", version);

        self.set_phase(SyncPhase::CleaningUp);
        self.notifications.notify(Notification::status("Cleaning up..."));
        self.collect_garbage(version).await;

        self.notifications.notify(Notification::status("Done!"));
        self.notifications.notify(Notification::UpdateInfo {
            status: UpdateStatus::Installed,
            date_checked: Some(now_rfc3339()),
            update_size: None,
            new_version: Some(version.to_string()),
            current_version: Some(version.to_string()),
        });
        self.set_phase(SyncPhase::Idle);

        Ok(SyncOutcome::Installed(SyncReport {
            previous,
            version: version.to_string(),
            fetched,
            copied,
            removed,
            bytes_fetched,
        }))
    }

    /// Writes every file of the new generation: unchanged files are copied
    /// forward, everything else is fetched.
    async fn build_generation(
        &self,
        reconciliation: &Reconciliation,
    ) -> MirrorResult<(Vec<String>, Vec<String>, u64)> {
        let version = reconciliation.upstream_app_version.as_str();
        self.blobs.open_generation(version).await?;

        let mut copied = Vec::new();
        let mut to_fetch: Vec<FileEntry> = reconciliation.to_fetch().cloned().collect();

        for entry in &reconciliation.unchanged {
            let carried = match reconciliation.local_generation.as_deref() {
                Some(previous) => self
                    .blobs
                    .copy(previous, version, &entry.url)
                    .await
                    .unwrap_or_else(|e| {
                        warn!("Failed to copy {} forward: {}", entry.url, e);
                        false
                    }),
                None => false,
            };

            if carried {
                copied.push(entry.url.clone());
            } else {
                warn!(
                    "{} is recorded but missing from the previous generation; fetching it",
                    entry.url
                );
                to_fetch.push(entry.clone());
            }
        }

        let (fetched, bytes_fetched) = self.fetch_into(version, to_fetch).await?;
        info!(
            "Generation {} built: {} fetched ({} bytes), {} copied",
            version,
            fetched.len(),
            bytes_fetched,
            copied.len()
        );
        Ok((fetched, copied, bytes_fetched))
    }

    /// Fetches `entries` into `generation`, at most `max_concurrent_downloads`
    /// at a time. The first failure cancels the remaining fetches.
    async fn fetch_into(
        &self,
        generation: &str,
        entries: Vec<FileEntry>,
    ) -> MirrorResult<(Vec<String>, u64)> {
        if entries.is_empty() {
            return Ok((Vec::new(), 0));
        }

        self.progress.set_length(entries.len() as u64);
        self.progress.set_position(0);
        self.progress.set_message(format!(
            "📦 Downloading {} file(s) for {}",
            entries.len(),
            generation
        ));

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_downloads.max(1)));
        let mut tasks = Vec::with_capacity(entries.len());

        for entry in entries {
            let semaphore = Arc::clone(&semaphore);
            let fetcher = Arc::clone(&self.fetcher);
            let blobs = Arc::clone(&self.blobs);
            let pb = self.progress.clone();
            let url = self.config.file_url(generation, &entry.url);
            let generation = generation.to_string();

            let task = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    MirrorError::Storage(format!("Download slots closed: {}", e))
                })?;
                pb.set_message(format!("| ⬇️  Downloading: {}", entry.url));

                let data = fetch_bytes(
                    fetcher.as_ref(),
                    &url,
                    FetchOptions::default(),
                    Some(entry.size),
                )
                .await?;
                let len = data.len() as u64;
                blobs.put(&generation, &entry.url, data).await?;

                pb.inc(1);
                Ok::<(String, u64), MirrorError>((entry.url, len))
            });
            tasks.push(task);
        }

        let mut fetched = Vec::with_capacity(tasks.len());
        let mut bytes_fetched = 0;
        let mut tasks = tasks.into_iter();

        while let Some(task) = tasks.next() {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(MirrorError::Storage(format!("Task join error: {}", e))),
            };
            match result {
                Ok((url, len)) => {
                    fetched.push(url);
                    bytes_fetched += len;
                }
                Err(e) => {
                    error!("Fetch task failed: {}", e);
                    self.progress.finish_with_message("❌ Download failed!");

                    // No task may write into the generation once we return.
                    let remaining: Vec<_> = tasks.by_ref().collect();
                    for task in &remaining {
                        task.abort();
                    }
                    for task in remaining {
                        let _ = task.await;
                    }
                    return Err(e);
                }
            }
        }

        self.progress
            .finish_with_message(format!("✅ Downloaded {} file(s)", fetched.len()));
        Ok((fetched, bytes_fetched))
    }

    /// Restores files of the active generation that are missing from the blob store.
    async fn heal(
        &self,
        manifest: &Manifest,
        records: &[FileVersionRecord],
    ) -> MirrorResult<SyncOutcome> {
        let version = manifest.app_version.as_str();
        self.set_phase(SyncPhase::Downloading);

        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for entry in &manifest.files {
            if !seen.insert(entry.url.as_str()) {
                continue;
            }
            if !self.blobs.contains(version, &entry.url).await? {
                missing.push(entry.clone());
            }
        }

        if missing.is_empty() {
            info!("Generation {} is complete, nothing to heal", version);
            return Ok(SyncOutcome::Healed(SyncReport {
                previous: Some(version.to_string()),
                version: version.to_string(),
                ..SyncReport::default()
            }));
        }

        warn!(
            "Generation {} is missing {} file(s), fetching them",
            version,
            missing.len()
        );
        // Writes land in the active generation, but only files it is
        // supposed to contain, so readers stay consistent either way.
        let (fetched, bytes_fetched) = self.fetch_into(version, missing.clone()).await?;

        let stale: Vec<&FileEntry> = missing
            .iter()
            .filter(|entry| {
                !records
                    .iter()
                    .any(|r| r.url == entry.url && r.content_version == entry.content_version)
            })
            .collect();
        if !stale.is_empty() {
            self.set_phase(SyncPhase::Committing);
            let mut txn = Transaction::new();
            for entry in stale {
                txn.put_record(&FileVersionRecord::from(entry));
            }
            self.metadata.commit(txn).await?;
        }

        Ok(SyncOutcome::Healed(SyncReport {
            previous: Some(version.to_string()),
            version: version.to_string(),
            fetched,
            bytes_fetched,
            ..SyncReport::default()
        }))
    }

    async fn discard_generation(&self, generation: &str) {
        match self.blobs.delete_generation(generation).await {
            Ok(_) => info!("Discarded partial generation {}", generation),
            Err(e) => warn!("Failed to discard partial generation {}: {}", generation, e),
        }
    }

    /// Deletes every generation except `keep`. Failures only cost disk space.
    async fn collect_garbage(&self, keep: &str) {
        let generations = match self.blobs.generations().await {
            Ok(generations) => generations,
            Err(e) => {
                warn!("Failed to list generations for cleanup: {}", e);
                return;
            }
        };

        for generation in generations.iter().filter(|g| g.as_str() != keep) {
            match self.blobs.delete_generation(generation).await {
                Ok(_) => info!("Old generation {} deleted", generation),
                Err(e) => warn!("Failed to delete old generation {}: {}", generation, e),
            }
        }
    }
}

fn now_rfc3339() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}
