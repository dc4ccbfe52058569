//! Publishing side: packing a directory into a manifest plus a versioned
//! file tree that the synchronizer can consume.

use crate::error::{MirrorError, MirrorResult};
use crate::manifest::encode_manifest;
use crate::types::{FileEntry, Manifest, MirrorConfig};
use std::path::{Path, PathBuf};
use tracing::info;

/// Computes the MD5 hash of a local file.
///
/// This function reads the file in chunks to avoid loading large files
/// entirely into memory. It runs in a blocking task to avoid blocking
/// the async runtime.
pub(crate) async fn compute_file_md5(path: &Path) -> MirrorResult<String> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> MirrorResult<String> {
        use md5::{Digest, Md5};
        use std::io::Read;

        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| MirrorError::IoError(std::io::Error::other(format!("Task join error: {}", e))))?
}

/// Lists regular files under `root`, sorted, as paths relative to it.
async fn list_files(root: &Path) -> MirrorResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        let mut entries = tokio::fs::read_dir(root.join(&relative)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let child = relative.join(entry.file_name());
            if file_type.is_dir() {
                pending.push(child);
            } else if file_type.is_file() {
                files.push(child);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn manifest_url(relative: &Path) -> String {
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    format!("./{}", parts.join("/"))
}

/// Publishes `source` as `version` under `target`.
///
/// Writes the encoded manifest to `{target}/{manifest_path}` and copies each
/// file to `{target}/{versioned_prefix}/{version}/...`. Each file's MD5
/// digest becomes its content version. A version that was already published
/// is never overwritten.
pub async fn build_release(
    config: &MirrorConfig,
    source: &Path,
    version: &str,
    target: &Path,
) -> MirrorResult<Manifest> {
    let versioned_dir = target.join(&config.versioned_prefix).join(version);
    if tokio::fs::try_exists(&versioned_dir).await? {
        return Err(MirrorError::Storage(format!(
            "version {} was already published at {:?}",
            version, versioned_dir
        )));
    }

    let mut manifest = Manifest {
        app_version: version.to_string(),
        files: Vec::new(),
    };

    for relative in list_files(source).await? {
        let path = source.join(&relative);
        let len = tokio::fs::metadata(&path).await?.len();
        let size = u32::try_from(len).map_err(|_| {
            MirrorError::Protocol(format!("{:?} is too large for a manifest entry", path))
        })?;
        let content_version = compute_file_md5(&path).await?;

        let destination = versioned_dir.join(&relative);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&path, &destination).await?;

        manifest
            .files
            .push(FileEntry::new(manifest_url(&relative), content_version, size));
    }

    // The manifest goes last, so clients never see a version whose files
    // are not in place yet.
    let encoded = encode_manifest(&manifest)?;
    tokio::fs::create_dir_all(target).await?;
    tokio::fs::write(target.join(&config.manifest_path), encoded).await?;

    info!(
        "Published {} with {} files ({} bytes)",
        version,
        manifest.files.len(),
        manifest.total_size()
    );
    Ok(manifest)
}
