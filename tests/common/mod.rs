//! Shared fixtures for synchronizer and interceptor tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use mirrorsync::{
    encode_manifest, BlobStore, ByteStream, CacheSynchronizer, FetchOptions, Fetcher, FileEntry,
    FileVersionRecord, Manifest, MemoryBlobStore, MemoryMetadataStore, MetadataKey,
    MetadataStore, MirrorConfig, MirrorError, MirrorResult, Transaction,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory remote that serves scripted responses and records every request.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: Mutex<HashMap<String, Bytes>>,
    failures: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<(String, FetchOptions)>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.into(), body.into());
    }

    /// Fails the next `times` requests for `url`.
    pub fn fail(&self, url: impl Into<String>, times: usize) {
        self.failures.lock().unwrap().insert(url.into(), times);
    }

    /// Fails every request for `url`.
    pub fn fail_always(&self, url: impl Into<String>) {
        self.fail(url, usize::MAX);
    }

    /// Publishes `manifest` and the bytes of its files.
    pub fn publish(&self, config: &MirrorConfig, manifest: &Manifest, contents: &[(&str, &str)]) {
        self.set(config.manifest_url(), encode_manifest(manifest).unwrap());
        for (url, body) in contents {
            self.set(
                config.file_url(&manifest.app_version, url),
                Bytes::from(body.to_string()),
            );
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn requests_with_options(&self) -> Vec<(String, FetchOptions)> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests for anything but the manifest.
    pub fn file_requests(&self, config: &MirrorConfig) -> Vec<String> {
        let manifest_url = config.manifest_url();
        let mut urls: Vec<String> = self
            .requests()
            .into_iter()
            .filter(|url| *url != manifest_url)
            .collect();
        urls.sort();
        urls
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, options: FetchOptions) -> MirrorResult<ByteStream> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), options));

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(MirrorError::Transport(format!(
                        "Failed to fetch {}: HTTP 503 Service Unavailable",
                        url
                    )));
                }
            }
        }

        let body = self
            .responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| {
                MirrorError::Transport(format!("Failed to fetch {}: HTTP 404 Not Found", url))
            })?;

        // Arbitrary chunk boundaries, as a real transport would deliver.
        let chunks: Vec<MirrorResult<Bytes>> = body
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

/// Blob store whose generation deletes can be made to fail.
#[derive(Default)]
pub struct FlakyBlobStore {
    pub inner: MemoryBlobStore,
    fail_delete_generation: AtomicBool,
}

impl FlakyBlobStore {
    pub fn fail_delete_generation(&self, fail: bool) {
        self.fail_delete_generation.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn open_generation(&self, generation: &str) -> MirrorResult<()> {
        self.inner.open_generation(generation).await
    }

    async fn get(&self, generation: &str, path: &str) -> MirrorResult<Option<Bytes>> {
        self.inner.get(generation, path).await
    }

    async fn put(&self, generation: &str, path: &str, data: Bytes) -> MirrorResult<()> {
        self.inner.put(generation, path, data).await
    }

    async fn delete(&self, generation: &str, path: &str) -> MirrorResult<bool> {
        self.inner.delete(generation, path).await
    }

    async fn delete_generation(&self, generation: &str) -> MirrorResult<bool> {
        if self.fail_delete_generation.load(Ordering::SeqCst) {
            return Err(MirrorError::Storage(format!(
                "permission denied removing {}",
                generation
            )));
        }
        self.inner.delete_generation(generation).await
    }

    async fn generations(&self) -> MirrorResult<Vec<String>> {
        self.inner.generations().await
    }
}

/// Metadata store whose commits can be made to fail.
#[derive(Default)]
pub struct FlakyMetadataStore {
    pub inner: MemoryMetadataStore,
    fail_commit: AtomicBool,
}

impl FlakyMetadataStore {
    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for FlakyMetadataStore {
    async fn get(&self, key: &MetadataKey) -> MirrorResult<Option<Value>> {
        self.inner.get(key).await
    }

    async fn file_records(&self) -> MirrorResult<Vec<FileVersionRecord>> {
        self.inner.file_records().await
    }

    async fn commit(&self, txn: Transaction) -> MirrorResult<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(MirrorError::Storage("disk full".to_string()));
        }
        self.inner.commit(txn).await
    }
}

pub fn test_config() -> MirrorConfig {
    MirrorConfig {
        base_url: "https://mirror.test/app".to_string(),
        index_file: Some("index.html".to_string()),
        max_concurrent_downloads: 2,
        sync_attempts: 3,
        retry_interval_ms: 10,
        ..MirrorConfig::default()
    }
}

pub fn manifest(version: &str, files: &[(&str, &str, u32)]) -> Manifest {
    Manifest {
        app_version: version.to_string(),
        files: files
            .iter()
            .map(|(url, hash, size)| FileEntry::new(*url, *hash, *size))
            .collect(),
    }
}

pub struct Harness {
    pub config: MirrorConfig,
    pub fetcher: Arc<ScriptedFetcher>,
    pub metadata: Arc<MemoryMetadataStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub sync: Arc<CacheSynchronizer>,
}

impl Harness {
    pub fn new() -> Self {
        let config = test_config();
        let fetcher = ScriptedFetcher::new();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let sync = Arc::new(CacheSynchronizer::new(
            config.clone(),
            fetcher.clone(),
            metadata.clone(),
            blobs.clone(),
        ));
        Self {
            config,
            fetcher,
            metadata,
            blobs,
            sync,
        }
    }

    /// Local state of the end-to-end scenario: `v1` active with
    /// `a.txt = h1` and `b.txt = h2`, also published upstream.
    pub async fn with_v1() -> Self {
        let harness = Self::new();
        let v1 = manifest("v1", &[("a.txt", "h1", 5), ("b.txt", "h2", 6)]);
        harness
            .fetcher
            .publish(&harness.config, &v1, &[("a.txt", "alpha"), ("b.txt", "bravo1")]);

        harness.blobs.open_generation("v1").await.unwrap();
        harness
            .blobs
            .put("v1", "a.txt", Bytes::from_static(b"alpha"))
            .await
            .unwrap();
        harness
            .blobs
            .put("v1", "b.txt", Bytes::from_static(b"bravo1"))
            .await
            .unwrap();

        let mut txn = Transaction::new();
        txn.put(MetadataKey::file("a.txt"), "h1")
            .put(MetadataKey::file("b.txt"), "h2")
            .put(MetadataKey::ActiveGeneration, "v1");
        harness.metadata.commit(txn).await.unwrap();
        harness
    }

    /// Upstream of the end-to-end scenario.
    pub fn publish_v2(&self) -> Manifest {
        let v2 = manifest(
            "v2",
            &[("a.txt", "h1", 10), ("b.txt", "h9", 20), ("c.txt", "h5", 5)],
        );
        self.fetcher.publish(
            &self.config,
            &v2,
            &[("a.txt", "alpha"), ("b.txt", "bravo9"), ("c.txt", "charlie")],
        );
        v2
    }

    pub async fn record(&self, url: &str) -> Option<String> {
        self.metadata
            .file_record(url)
            .await
            .unwrap()
            .map(|r| r.content_version)
    }
}
