//! Fetch collaborator: how bytes are retrieved from the remote source.

use crate::error::{MirrorError, MirrorResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, TryStreamExt};
use std::pin::Pin;
use tracing::{debug, warn};

/// A boxed stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = MirrorResult<Bytes>> + Send>>;

/// Per-request fetch options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Ask every intermediate cache to revalidate with the origin.
    pub bypass_cache: bool,
}

impl FetchOptions {
    pub fn bypass_cache() -> Self {
        Self { bypass_cache: true }
    }
}

/// Retrieves remote bytes.
///
/// Implementations must return an error for non-success responses rather
/// than a stream of an error page.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, url: &str, options: FetchOptions) -> MirrorResult<ByteStream>;
}

/// Fetches `url` and collects the whole body.
///
/// `expected_size` is advisory: a mismatch is logged, not rejected, since the
/// content version is the authoritative identity of a file.
pub async fn fetch_bytes(
    fetcher: &dyn Fetcher,
    url: &str,
    options: FetchOptions,
    expected_size: Option<u32>,
) -> MirrorResult<Bytes> {
    let mut stream = fetcher.fetch(url, options).await?;
    let mut body = BytesMut::with_capacity(expected_size.map(|s| s as usize).unwrap_or(0));
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk?);
    }

    if let Some(expected) = expected_size {
        if body.len() as u64 != u64::from(expected) {
            warn!(
                "Size mismatch for {}: manifest says {} bytes, got {} bytes",
                url,
                expected,
                body.len()
            );
        }
    }
    Ok(body.freeze())
}

/// HTTP fetcher backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, options: FetchOptions) -> MirrorResult<ByteStream> {
        let mut request = self.client.get(url);
        if options.bypass_cache {
            request = request
                .header(reqwest::header::CACHE_CONTROL, "no-cache")
                .header(reqwest::header::PRAGMA, "no-cache");
        }

        let response = request
            .send()
            .await
            .map_err(|e| MirrorError::Transport(format!("Failed to fetch {}: {}", url, e)))?;

        // Check HTTP status code
        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::Transport(format!(
                "Failed to fetch {}: HTTP {}",
                url, status
            )));
        }
        debug!(
            "Fetching {} ({} bytes announced)",
            url,
            response
                .content_length()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );

        Ok(Box::pin(response.bytes_stream().map_err(MirrorError::from)))
    }
}
