//! MirrorSync - Offline mirror of a versioned remote file set with atomic upgrades
//!
//! This library keeps a local copy of a published file set usable while
//! offline, and upgrades it incrementally when a new version is published.
//!
//! # Features
//!
//! - **Streaming Manifest Decoding**: Resumable decoder for the compact binary manifest
//! - **Minimal Transfer**: Only files whose content version changed are fetched
//! - **Atomic Generations**: A new version becomes active in one metadata transaction
//! - **Self-Healing Reads**: Missing files are repaired, then resynced, before failing
//! - **Status Broadcast**: Progress and update info fan out to every observer
//!
//! # Example
//!
//! ```no_run
//! use mirrorsync::{
//!     CacheSynchronizer, FsBlobStore, HttpFetcher, JsonFileMetadataStore, MirrorConfig,
//!     RequestInterceptor,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MirrorConfig::default();
//! let metadata = JsonFileMetadataStore::open(".mirror/metadata.json").await?;
//! let sync = Arc::new(CacheSynchronizer::new(
//!     config,
//!     Arc::new(HttpFetcher::new()),
//!     Arc::new(metadata),
//!     Arc::new(FsBlobStore::new(".mirror/blobs")),
//! ));
//!
//! sync.synchronize().await?;
//! let page = RequestInterceptor::new(sync).resolve("./index.html").await?;
//! println!("{} bytes", page.body.len());
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod control;
pub mod error;
pub mod fetch;
pub mod generation;
pub mod interceptor;
pub mod manifest;
pub mod metadata;
pub mod notify;
pub mod orchestrator;
pub mod reconcile;
pub mod release;
pub mod types;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use control::{handle_control, ControlRequest, ENGINE_VERSION};
pub use error::{MirrorError, MirrorResult};
pub use fetch::{fetch_bytes, ByteStream, FetchOptions, Fetcher, HttpFetcher};
pub use generation::ActiveGeneration;
pub use interceptor::{RequestInterceptor, ResolveSource, Resolved};
pub use manifest::{decode_stream, encode_manifest, ManifestDecoder};
pub use metadata::{
    JsonFileMetadataStore, MemoryMetadataStore, MetadataKey, MetadataStore, Transaction,
    UpdateInfo,
};
pub use notify::{Notification, NotificationChannel, UpdateStatus};
pub use orchestrator::{CacheSynchronizer, SyncOutcome, SyncReport};
pub use reconcile::{diff, reconcile, Reconciliation};
pub use release::build_release;
pub use types::{FileEntry, FileVersionRecord, Manifest, MirrorConfig, SyncPhase};
