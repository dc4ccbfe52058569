//! Metadata store: the active generation pointer, per-file version records
//! and the bookkeeping of the last update check.
//!
//! Every mutation goes through a [`Transaction`], which a store applies
//! all-or-nothing.

use crate::error::{MirrorError, MirrorResult};
use crate::types::FileVersionRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

const FILE_PREFIX: &str = "file:";

/// A key in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetadataKey {
    /// Label of the generation currently served.
    ActiveGeneration,
    /// When the upstream manifest was last checked (RFC 3339).
    LastChecked,
    /// Whether the last check found a different upstream version.
    UpdateAvailable,
    /// Total bytes of the upstream file set at the last check.
    UpdateSizeEstimate,
    /// Upstream version seen at the last check.
    UpstreamVersion,
    /// Content version last synchronized for one file.
    File(String),
}

impl MetadataKey {
    pub fn file(url: impl Into<String>) -> Self {
        MetadataKey::File(url.into())
    }

    /// The key as written to durable storage.
    pub fn as_storage_key(&self) -> String {
        match self {
            MetadataKey::ActiveGeneration => "active-generation".to_string(),
            MetadataKey::LastChecked => "last-checked-timestamp".to_string(),
            MetadataKey::UpdateAvailable => "update-available".to_string(),
            MetadataKey::UpdateSizeEstimate => "update-size-estimate".to_string(),
            MetadataKey::UpstreamVersion => "upstream-version".to_string(),
            MetadataKey::File(url) => format!("{}{}", FILE_PREFIX, url),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "active-generation" => Some(MetadataKey::ActiveGeneration),
            "last-checked-timestamp" => Some(MetadataKey::LastChecked),
            "update-available" => Some(MetadataKey::UpdateAvailable),
            "update-size-estimate" => Some(MetadataKey::UpdateSizeEstimate),
            "upstream-version" => Some(MetadataKey::UpstreamVersion),
            other => other
                .strip_prefix(FILE_PREFIX)
                .map(|url| MetadataKey::File(url.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Put(MetadataKey, Value),
    Delete(MetadataKey),
}

/// An ordered batch of writes applied atomically by [`MetadataStore::commit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: MetadataKey, value: impl Into<Value>) -> &mut Self {
        self.ops.push(Op::Put(key, value.into()));
        self
    }

    pub fn put_record(&mut self, record: &FileVersionRecord) -> &mut Self {
        self.put(
            MetadataKey::file(record.url.clone()),
            record.content_version.clone(),
        )
    }

    pub fn delete(&mut self, key: MetadataKey) -> &mut Self {
        self.ops.push(Op::Delete(key));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    fn apply_to(&self, map: &mut BTreeMap<String, Value>) {
        for op in &self.ops {
            match op {
                Op::Put(key, value) => {
                    map.insert(key.as_storage_key(), value.clone());
                }
                Op::Delete(key) => {
                    map.remove(&key.as_storage_key());
                }
            }
        }
    }
}

/// Snapshot of what the last update check found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub update_available: bool,
    pub last_checked: Option<String>,
    pub update_size: Option<u64>,
    pub upstream_version: Option<String>,
    pub current_version: Option<String>,
}

/// Durable key-value store with atomic multi-key transactions.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn get(&self, key: &MetadataKey) -> MirrorResult<Option<Value>>;

    /// Every file version record currently stored.
    async fn file_records(&self) -> MirrorResult<Vec<FileVersionRecord>>;

    /// Applies all writes of `txn`, or none of them.
    async fn commit(&self, txn: Transaction) -> MirrorResult<()>;

    async fn active_generation(&self) -> MirrorResult<Option<String>> {
        Ok(self
            .get(&MetadataKey::ActiveGeneration)
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    async fn file_record(&self, url: &str) -> MirrorResult<Option<FileVersionRecord>> {
        Ok(self
            .get(&MetadataKey::file(url))
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .map(|content_version| FileVersionRecord {
                url: url.to_string(),
                content_version,
            }))
    }

    async fn update_info(&self) -> MirrorResult<UpdateInfo> {
        let string = |v: Option<Value>| v.and_then(|v| v.as_str().map(str::to_string));
        Ok(UpdateInfo {
            update_available: self
                .get(&MetadataKey::UpdateAvailable)
                .await?
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            last_checked: string(self.get(&MetadataKey::LastChecked).await?),
            update_size: self
                .get(&MetadataKey::UpdateSizeEstimate)
                .await?
                .and_then(|v| v.as_u64()),
            upstream_version: string(self.get(&MetadataKey::UpstreamVersion).await?),
            current_version: self.active_generation().await?,
        })
    }
}

fn records_in(map: &BTreeMap<String, Value>) -> Vec<FileVersionRecord> {
    map.iter()
        .filter_map(|(key, value)| {
            let url = key.strip_prefix(FILE_PREFIX)?;
            Some(FileVersionRecord {
                url: url.to_string(),
                content_version: value.as_str()?.to_string(),
            })
        })
        .collect()
}

/// In-process metadata store.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    entries: RwLock<BTreeMap<String, Value>>,
    commits: AtomicUsize,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions committed so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Copy of the raw key space, for inspection.
    pub async fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, key: &MetadataKey) -> MirrorResult<Option<Value>> {
        Ok(self.entries.read().await.get(&key.as_storage_key()).cloned())
    }

    async fn file_records(&self) -> MirrorResult<Vec<FileVersionRecord>> {
        Ok(records_in(&*self.entries.read().await))
    }

    async fn commit(&self, txn: Transaction) -> MirrorResult<()> {
        let mut entries = self.entries.write().await;
        txn.apply_to(&mut entries);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Metadata store persisted as a single JSON document.
///
/// A commit writes the new document to a temporary file, fsyncs it and
/// renames it over the old one, so a crash leaves either the old or the new
/// state on disk.
#[derive(Debug)]
pub struct JsonFileMetadataStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Value>>,
}

impl JsonFileMetadataStore {
    /// Opens the store at `path`, starting empty when the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> MirrorResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(content) => {
                let entries: BTreeMap<String, Value> = serde_json::from_slice(&content)?;
                info!("Loaded {} metadata entries from {:?}", entries.len(), path);
                entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &BTreeMap<String, Value>) -> MirrorResult<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| MirrorError::Storage(format!("invalid metadata path {:?}", self.path)))?
            .to_string_lossy();
        let temp_path = parent.join(format!(".{}.tmp.{}", file_name, Uuid::new_v4()));

        let document = serde_json::to_vec_pretty(entries)?;
        {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&document).await?;
            file.sync_all().await?;
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonFileMetadataStore {
    async fn get(&self, key: &MetadataKey) -> MirrorResult<Option<Value>> {
        Ok(self.entries.read().await.get(&key.as_storage_key()).cloned())
    }

    async fn file_records(&self) -> MirrorResult<Vec<FileVersionRecord>> {
        Ok(records_in(&*self.entries.read().await))
    }

    async fn commit(&self, txn: Transaction) -> MirrorResult<()> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        txn.apply_to(&mut next);

        // Memory only moves forward once the new document is durable.
        self.persist(&next).await?;
        *entries = next;
        debug!("Committed {} metadata operation(s) to {:?}", txn.len(), self.path);
        Ok(())
    }
}
