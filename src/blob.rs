//! Blob store: file bytes, namespaced per generation.

use crate::error::{MirrorError, MirrorResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Content cache addressed by `(generation, path)`.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Creates an empty namespace for `generation`, discarding anything a
    /// previous, unfinished attempt left under the same label.
    async fn open_generation(&self, generation: &str) -> MirrorResult<()>;

    async fn get(&self, generation: &str, path: &str) -> MirrorResult<Option<Bytes>>;

    async fn put(&self, generation: &str, path: &str, data: Bytes) -> MirrorResult<()>;

    /// Returns whether the blob existed.
    async fn delete(&self, generation: &str, path: &str) -> MirrorResult<bool>;

    /// Removes every blob of `generation`. Returns whether it existed.
    async fn delete_generation(&self, generation: &str) -> MirrorResult<bool>;

    /// Labels of all generations present.
    async fn generations(&self) -> MirrorResult<Vec<String>>;

    async fn contains(&self, generation: &str, path: &str) -> MirrorResult<bool> {
        Ok(self.get(generation, path).await?.is_some())
    }

    /// Copies one blob between generations. Returns `false` when the source is absent.
    async fn copy(&self, from: &str, to: &str, path: &str) -> MirrorResult<bool> {
        match self.get(from, path).await? {
            Some(data) => {
                self.put(to, path, data).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// In-process blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    generations: RwLock<HashMap<String, HashMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths stored under `generation`, sorted.
    pub async fn paths(&self, generation: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .generations
            .read()
            .await
            .get(generation)
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn open_generation(&self, generation: &str) -> MirrorResult<()> {
        self.generations
            .write()
            .await
            .insert(generation.to_string(), HashMap::new());
        Ok(())
    }

    async fn get(&self, generation: &str, path: &str) -> MirrorResult<Option<Bytes>> {
        Ok(self
            .generations
            .read()
            .await
            .get(generation)
            .and_then(|blobs| blobs.get(path))
            .cloned())
    }

    async fn put(&self, generation: &str, path: &str, data: Bytes) -> MirrorResult<()> {
        self.generations
            .write()
            .await
            .entry(generation.to_string())
            .or_default()
            .insert(path.to_string(), data);
        Ok(())
    }

    async fn delete(&self, generation: &str, path: &str) -> MirrorResult<bool> {
        Ok(self
            .generations
            .write()
            .await
            .get_mut(generation)
            .and_then(|blobs| blobs.remove(path))
            .is_some())
    }

    async fn delete_generation(&self, generation: &str) -> MirrorResult<bool> {
        Ok(self.generations.write().await.remove(generation).is_some())
    }

    async fn generations(&self) -> MirrorResult<Vec<String>> {
        let mut labels: Vec<String> = self.generations.read().await.keys().cloned().collect();
        labels.sort();
        Ok(labels)
    }
}

const GENERATION_DIR_PREFIX: &str = "gen-";

/// Blob store on the local filesystem, one directory per generation.
///
/// Blobs are written to a uniquely named temporary file, fsynced and renamed
/// into place, so readers never observe a partially written blob.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Labels are upstream version strings and may contain anything, so the
    /// directory name carries them hex-encoded.
    fn generation_dir(&self, generation: &str) -> PathBuf {
        self.root.join(format!(
            "{}{}",
            GENERATION_DIR_PREFIX,
            hex::encode(generation.as_bytes())
        ))
    }

    fn blob_path(&self, generation: &str, path: &str) -> MirrorResult<PathBuf> {
        let mut resolved = self.generation_dir(generation);
        let relative = path.trim_start_matches("./").trim_start_matches('/');

        let mut depth = 0;
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => {
                    return Err(MirrorError::Storage(format!(
                        "invalid blob path: {:?}",
                        path
                    )))
                }
            }
        }
        if depth == 0 {
            return Err(MirrorError::Storage(format!("invalid blob path: {:?}", path)));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn open_generation(&self, generation: &str) -> MirrorResult<()> {
        let dir = self.generation_dir(generation);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("Cleared leftover generation directory {:?}", dir),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(())
    }

    async fn get(&self, generation: &str, path: &str) -> MirrorResult<Option<Bytes>> {
        let file = self.blob_path(generation, path)?;
        match tokio::fs::read(&file).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, generation: &str, path: &str, data: Bytes) -> MirrorResult<()> {
        let file = self.blob_path(generation, path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        let temp_path = file.with_file_name(
            file.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or_else(|| temp_name.clone()),
        );
        {
            let mut out = tokio::fs::File::create(&temp_path).await?;
            out.write_all(&data).await?;
            out.sync_all().await?;
        }
        tokio::fs::rename(&temp_path, &file).await?;
        Ok(())
    }

    async fn delete(&self, generation: &str, path: &str) -> MirrorResult<bool> {
        let file = self.blob_path(generation, path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_generation(&self, generation: &str) -> MirrorResult<bool> {
        let dir = self.generation_dir(generation);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn generations(&self) -> MirrorResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut labels = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(encoded) = name
                .to_str()
                .and_then(|n| n.strip_prefix(GENERATION_DIR_PREFIX))
            else {
                continue;
            };
            match hex::decode(encoded).ok().and_then(|raw| String::from_utf8(raw).ok()) {
                Some(label) => labels.push(label),
                None => debug!("Skipping foreign directory {:?}", name),
            }
        }
        labels.sort();
        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_copy_between_generations() {
        let store = MemoryBlobStore::new();
        store.open_generation("v1").await.unwrap();
        store
            .put("v1", "a.txt", Bytes::from_static(b"alpha"))
            .await
            .unwrap();
        store.open_generation("v2").await.unwrap();

        assert!(store.copy("v1", "v2", "a.txt").await.unwrap());
        assert!(!store.copy("v1", "v2", "missing.txt").await.unwrap());
        assert_eq!(store.paths("v2").await, vec!["a.txt".to_string()]);

        assert!(store.delete_generation("v1").await.unwrap());
        assert_eq!(store.generations().await.unwrap(), vec!["v2".to_string()]);
    }

    #[tokio::test]
    async fn test_fs_store_round_trip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store.open_generation("0.24.1").await.unwrap();
        store
            .put("0.24.1", "./build/bundle.js", Bytes::from_static(b"js"))
            .await
            .unwrap();

        assert_eq!(
            store.get("0.24.1", "./build/bundle.js").await.unwrap(),
            Some(Bytes::from_static(b"js"))
        );
        assert!(store.contains("0.24.1", "build/bundle.js").await.unwrap());
        assert_eq!(store.get("0.24.1", "missing").await.unwrap(), None);
        assert_eq!(store.generations().await.unwrap(), vec!["0.24.1".to_string()]);

        assert!(store.delete("0.24.1", "./build/bundle.js").await.unwrap());
        assert!(!store.delete("0.24.1", "./build/bundle.js").await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_accepts_any_version_string() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        for label in ["2024/10", "..", "a\\b"] {
            store.open_generation(label).await.unwrap();
            store
                .put(label, "index.html", Bytes::from_static(b"<html>"))
                .await
                .unwrap();
        }
        std::fs::create_dir(dir.path().join("gen-not-hex")).unwrap();

        assert_eq!(
            store.generations().await.unwrap(),
            vec!["..".to_string(), "2024/10".to_string(), "a\\b".to_string()]
        );
        assert_eq!(
            store.get("2024/10", "index.html").await.unwrap(),
            Some(Bytes::from_static(b"<html>"))
        );
        // Every label is a single directory directly under the root.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 4);

        assert!(store.delete_generation("2024/10").await.unwrap());
        assert_eq!(store.get("2024/10", "index.html").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fs_open_generation_discards_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store.open_generation("v2").await.unwrap();
        store
            .put("v2", "partial.bin", Bytes::from_static(b"half"))
            .await
            .unwrap();
        store.open_generation("v2").await.unwrap();

        assert_eq!(store.get("v2", "partial.bin").await.unwrap(), None);
        assert!(store.delete_generation("v2").await.unwrap());
        assert!(!store.delete_generation("v2").await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        assert!(store.get("v1", "../secret").await.is_err());
        assert!(store.get("v1", "").await.is_err());
        assert!(store.get("../v1", "a.txt").await.is_err());
        assert!(store.open_generation("a/b").await.is_err());
    }
}
