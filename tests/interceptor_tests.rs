mod common;

use bytes::Bytes;
use common::{manifest, Harness};
use mirrorsync::{
    BlobStore, CacheSynchronizer, FsBlobStore, MemoryMetadataStore, MetadataStore, MirrorError,
    RequestInterceptor, ResolveSource,
};
use std::sync::Arc;

#[tokio::test]
async fn test_hit_is_served_without_network() {
    let h = Harness::with_v1().await;
    let interceptor = RequestInterceptor::new(h.sync.clone());

    let resolved = interceptor.resolve("a.txt").await.unwrap();
    assert_eq!(resolved.source, ResolveSource::Cache);
    assert_eq!(resolved.body, Bytes::from_static(b"alpha"));
    assert!(h.fetcher.requests().is_empty());
}

#[tokio::test]
async fn test_missing_blob_is_repaired_alone() {
    let h = Harness::with_v1().await;
    h.blobs.delete("v1", "b.txt").await.unwrap();
    let interceptor = RequestInterceptor::new(h.sync.clone());

    let resolved = interceptor.resolve("b.txt").await.unwrap();
    assert_eq!(resolved.source, ResolveSource::Repaired);
    assert_eq!(resolved.body, Bytes::from_static(b"bravo1"));
    assert_eq!(h.fetcher.requests(), vec![h.config.file_url("v1", "b.txt")]);

    // Written back into the active generation.
    assert_eq!(
        h.blobs.get("v1", "b.txt").await.unwrap(),
        Some(Bytes::from_static(b"bravo1"))
    );
    let again = interceptor.resolve("b.txt").await.unwrap();
    assert_eq!(again.source, ResolveSource::Cache);
}

#[tokio::test]
async fn test_failed_repair_escalates_to_heal() {
    let h = Harness::with_v1().await;
    h.blobs.delete("v1", "b.txt").await.unwrap();
    h.fetcher.fail(h.config.file_url("v1", "b.txt"), 1);
    let interceptor = RequestInterceptor::new(h.sync.clone());

    let resolved = interceptor.resolve("b.txt").await.unwrap();
    assert_eq!(resolved.source, ResolveSource::Resynced);
    assert_eq!(resolved.body, Bytes::from_static(b"bravo1"));
    assert_eq!(h.metadata.active_generation().await.unwrap().as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_failed_repair_escalates_to_upgrade() {
    let h = Harness::with_v1().await;
    h.blobs.delete("v1", "b.txt").await.unwrap();
    h.fetcher.fail_always(h.config.file_url("v1", "b.txt"));
    h.publish_v2();
    let interceptor = RequestInterceptor::new(h.sync.clone());

    let resolved = interceptor.resolve("b.txt").await.unwrap();
    assert_eq!(resolved.source, ResolveSource::Resynced);
    assert_eq!(resolved.body, Bytes::from_static(b"bravo9"));
    assert_eq!(h.metadata.active_generation().await.unwrap().as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_unrecoverable_miss_is_an_inconsistency() {
    let h = Harness::with_v1().await;
    h.blobs.delete("v1", "b.txt").await.unwrap();
    h.fetcher.fail_always(h.config.file_url("v1", "b.txt"));
    let interceptor = RequestInterceptor::new(h.sync.clone());

    let err = interceptor.resolve("b.txt").await.unwrap_err();
    assert!(matches!(err, MirrorError::StorageInconsistency(_)));

    // The rest of the mirror keeps working.
    let resolved = interceptor.resolve("a.txt").await.unwrap();
    assert_eq!(resolved.source, ResolveSource::Cache);
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let h = Harness::with_v1().await;
    let interceptor = RequestInterceptor::new(h.sync.clone());

    let err = interceptor.resolve("nope.txt").await.unwrap_err();
    assert!(matches!(err, MirrorError::NotFound(ref path) if path == "nope.txt"));
    assert!(h.fetcher.requests().is_empty());
}

#[tokio::test]
async fn test_root_serves_index_after_first_install() {
    let h = Harness::new();
    let v1 = manifest("v1", &[("index.html", "i1", 13)]);
    h.fetcher
        .publish(&h.config, &v1, &[("index.html", "<html></html>")]);
    let interceptor = RequestInterceptor::new(h.sync.clone());

    let resolved = interceptor.resolve("/").await.unwrap();
    assert_eq!(resolved.path, "index.html");
    assert_eq!(resolved.source, ResolveSource::Cache);
    assert_eq!(resolved.body, Bytes::from_static(b"<html></html>"));
    assert_eq!(h.metadata.active_generation().await.unwrap().as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_reads_follow_committed_generation() {
    let h = Harness::with_v1().await;
    let interceptor = RequestInterceptor::new(h.sync.clone());
    interceptor.resolve("a.txt").await.unwrap();

    h.publish_v2();
    h.sync.synchronize().await.unwrap();
    h.fetcher.clear_requests();

    let resolved = interceptor.resolve("c.txt").await.unwrap();
    assert_eq!(resolved.source, ResolveSource::Cache);
    assert_eq!(resolved.body, Bytes::from_static(b"charlie"));
    assert!(h.fetcher.requests().is_empty());
}

#[tokio::test]
async fn test_request_spellings_share_one_record() {
    let h = Harness::new();
    let v1 = manifest("v1", &[("./index.html", "i1", 6)]);
    h.fetcher.publish(&h.config, &v1, &[("./index.html", "<html>")]);
    h.sync.synchronize().await.unwrap();
    let interceptor = RequestInterceptor::new(h.sync.clone());

    for request in ["index.html", "/index.html", "./index.html", "/"] {
        let resolved = interceptor.resolve(request).await.unwrap();
        assert_eq!(resolved.path, "./index.html");
        assert_eq!(resolved.source, ResolveSource::Cache);
    }

    h.blobs.delete("v1", "./index.html").await.unwrap();
    let resolved = interceptor.resolve("index.html").await.unwrap();
    assert_eq!(resolved.source, ResolveSource::Repaired);
    assert_eq!(resolved.body, Bytes::from_static(b"<html>"));
}

#[tokio::test]
async fn test_evicted_blob_is_repaired_through_alias_on_disk() {
    let h = Harness::new();
    let v1 = manifest("v1", &[("./index.html", "i1", 6)]);
    h.fetcher.publish(&h.config, &v1, &[("./index.html", "<html>")]);

    let dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(FsBlobStore::new(dir.path()));
    let sync = Arc::new(CacheSynchronizer::new(
        h.config.clone(),
        h.fetcher.clone(),
        Arc::new(MemoryMetadataStore::new()),
        blobs.clone(),
    ));
    sync.synchronize().await.unwrap();
    let interceptor = RequestInterceptor::new(sync);

    let resolved = interceptor.resolve("index.html").await.unwrap();
    assert_eq!(resolved.source, ResolveSource::Cache);

    assert!(blobs.delete("v1", "./index.html").await.unwrap());
    h.fetcher.clear_requests();
    let resolved = interceptor.resolve("index.html").await.unwrap();
    assert_eq!(resolved.source, ResolveSource::Repaired);
    assert_eq!(resolved.path, "./index.html");
    assert_eq!(
        h.fetcher.requests(),
        vec![h.config.file_url("v1", "./index.html")]
    );
    assert!(blobs.contains("v1", "./index.html").await.unwrap());
}
