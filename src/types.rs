//! Data structures shared by the mirror components.

use serde::{Deserialize, Serialize};

/// One file listed by the upstream manifest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Stable identifier of the file, also its path inside a generation.
    pub url: String,
    /// Opaque tag (usually a hash) that changes whenever the content does.
    pub content_version: String,
    /// Size of the file in bytes.
    pub size: u32,
}

impl FileEntry {
    pub fn new(url: impl Into<String>, content_version: impl Into<String>, size: u32) -> Self {
        Self {
            url: url.into(),
            content_version: content_version.into(),
            size,
        }
    }
}

/// Decoded description of the remote file set for one upstream version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    /// Upstream version label; becomes the generation label once installed.
    pub app_version: String,
    /// Files in publication order.
    pub files: Vec<FileEntry>,
}

impl Manifest {
    /// Sum of all file sizes, used as the update size estimate.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| u64::from(f.size)).sum()
    }

    pub fn get(&self, url: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.url == url)
    }
}

/// The content version last synchronized for one mirrored file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileVersionRecord {
    pub url: String,
    pub content_version: String,
}

impl From<&FileEntry> for FileVersionRecord {
    fn from(entry: &FileEntry) -> Self {
        Self {
            url: entry.url.clone(),
            content_version: entry.content_version.clone(),
        }
    }
}

/// Configuration for checking and synchronizing a mirror.
///
/// # Example
///
/// ```
/// use mirrorsync::MirrorConfig;
///
/// let config = MirrorConfig {
///     base_url: "https://example.com/app".to_string(),
///     data_dir: ".mirror".to_string(),
///     max_concurrent_downloads: 8,
///     ..MirrorConfig::default()
/// };
/// assert_eq!(config.manifest_url(), "https://example.com/app/version");
/// ```
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Base URL of the published release tree (e.g., `<https://example.com/app>`)
    pub base_url: String,
    /// Local directory holding metadata and blobs (e.g., `".mirror"`)
    pub data_dir: String,
    /// Path of the binary manifest relative to `base_url`.
    pub manifest_path: String,
    /// Directory under `base_url` that holds one subdirectory per version.
    pub versioned_prefix: String,
    /// File served when the root of the mirror is requested.
    pub index_file: Option<String>,
    /// Maximum number of concurrent file fetches during a sync (default: 4).
    pub max_concurrent_downloads: usize,
    /// Whole-attempt retries for `synchronize_with_retry` (default: 3).
    pub sync_attempts: usize,
    /// Pause between whole attempts, in milliseconds (default: 10s).
    pub retry_interval_ms: u64,
}

impl MirrorConfig {
    pub fn manifest_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.manifest_path
        )
    }

    /// URL of one file as published for `app_version`.
    pub fn file_url(&self, app_version: &str, url: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.versioned_prefix,
            app_version,
            url.trim_start_matches("./").trim_start_matches('/')
        )
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            data_dir: ".mirror".to_string(),
            manifest_path: "version".to_string(),
            versioned_prefix: "versioned".to_string(),
            index_file: Some("./index.html".to_string()),
            max_concurrent_downloads: 4,
            sync_attempts: 3,
            retry_interval_ms: 10_000,
        }
    }
}

/// Where a synchronization attempt currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    Idle,
    Checking,
    NoUpdateNeeded,
    Downloading,
    Committing,
    CleaningUp,
    /// The last pass failed. Held until the next pass starts.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_url_strips_relative_prefix() {
        let config = MirrorConfig {
            base_url: "https://example.com/app/".to_string(),
            ..MirrorConfig::default()
        };
        assert_eq!(
            config.file_url("1.2.0", "./build/bundle.js"),
            "https://example.com/app/versioned/1.2.0/build/bundle.js"
        );
        assert_eq!(config.manifest_url(), "https://example.com/app/version");
    }

    #[test]
    fn test_manifest_total_size() {
        let manifest = Manifest {
            app_version: "v2".to_string(),
            files: vec![
                FileEntry::new("a.txt", "h1", 10),
                FileEntry::new("b.txt", "h9", u32::MAX),
            ],
        };
        assert_eq!(manifest.total_size(), 10 + u64::from(u32::MAX));
        assert_eq!(manifest.get("a.txt").map(|f| f.size), Some(10));
        assert!(manifest.get("c.txt").is_none());
    }
}
