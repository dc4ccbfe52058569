//! Version reconciliation: diffing an upstream manifest against local records.

use crate::error::MirrorResult;
use crate::metadata::MetadataStore;
use crate::types::{FileEntry, FileVersionRecord, Manifest};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Per-file classification of a manifest against local records.
///
/// `unchanged`, `changed` and `new` are disjoint and keep manifest order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub upstream_app_version: String,
    /// Label of the generation active when the diff was taken.
    pub local_generation: Option<String>,
    /// A local record exists with the same content version.
    pub unchanged: Vec<FileEntry>,
    /// A local record exists with a different content version.
    pub changed: Vec<FileEntry>,
    /// No local record exists.
    pub new: Vec<FileEntry>,
}

impl Reconciliation {
    /// Whole-mirror comparison; decides whether a sync is needed at all.
    pub fn version_changed(&self) -> bool {
        self.local_generation.as_deref() != Some(self.upstream_app_version.as_str())
    }

    /// Files that must come from the network.
    pub fn to_fetch(&self) -> impl Iterator<Item = &FileEntry> {
        self.changed.iter().chain(self.new.iter())
    }

    /// Bytes that must come from the network, according to the manifest.
    pub fn fetch_size(&self) -> u64 {
        self.to_fetch().map(|f| u64::from(f.size)).sum()
    }

    /// Locally recorded files the manifest no longer lists.
    pub fn removed<'a>(&self, records: &'a [FileVersionRecord]) -> Vec<&'a FileVersionRecord> {
        let listed: HashSet<&str> = self
            .unchanged
            .iter()
            .chain(self.to_fetch())
            .map(|f| f.url.as_str())
            .collect();
        records
            .iter()
            .filter(|r| !listed.contains(r.url.as_str()))
            .collect()
    }
}

/// Classifies every manifest file against `records`.
///
/// A URL listed more than once is classified by its first occurrence.
pub fn diff(
    manifest: &Manifest,
    records: &[FileVersionRecord],
    local_generation: Option<&str>,
) -> Reconciliation {
    let local: HashMap<&str, &str> = records
        .iter()
        .map(|r| (r.url.as_str(), r.content_version.as_str()))
        .collect();

    let mut result = Reconciliation {
        upstream_app_version: manifest.app_version.clone(),
        local_generation: local_generation.map(str::to_string),
        ..Reconciliation::default()
    };

    let mut seen = HashSet::new();
    for entry in &manifest.files {
        if !seen.insert(entry.url.as_str()) {
            warn!("Manifest lists {} more than once; ignoring duplicate", entry.url);
            continue;
        }
        match local.get(entry.url.as_str()) {
            Some(version) if *version == entry.content_version => {
                result.unchanged.push(entry.clone())
            }
            Some(_) => result.changed.push(entry.clone()),
            None => result.new.push(entry.clone()),
        }
    }
    result
}

/// Reads local records from `store` and diffs `manifest` against them.
pub async fn reconcile(
    manifest: &Manifest,
    store: &dyn MetadataStore,
) -> MirrorResult<Reconciliation> {
    let records = store.file_records().await?;
    let local_generation = store.active_generation().await?;
    let result = diff(manifest, &records, local_generation.as_deref());

    info!(
        "Reconciled {} against {}: {} unchanged, {} changed, {} new",
        result.upstream_app_version,
        local_generation.as_deref().unwrap_or("<none>"),
        result.unchanged.len(),
        result.changed.len(),
        result.new.len()
    );
    Ok(result)
}
