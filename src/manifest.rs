//! Binary manifest codec.
//!
//! Wire format, all integers little-endian:
//!
//! ```text
//! STRING(app_version) UINT16(file_count)
//! file_count × { STRING(url) STRING(content_version) UINT32(size) }
//! STRING := UINT16(length) length × BYTE(utf8)
//! ```
//!
//! [`ManifestDecoder`] is a resumable push decoder: a transport can hand it
//! chunks of any size, down to single bytes, and it picks up exactly where the
//! previous chunk ended.

use crate::error::{MirrorError, MirrorResult};
use crate::types::{FileEntry, Manifest};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info};

/// Field of the manifest the decoder is currently reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    AppVersionLength,
    AppVersion,
    FileCount,
    UrlLength,
    Url,
    ContentVersionLength,
    ContentVersion,
    Size,
}

impl Field {
    fn name(self) -> &'static str {
        match self {
            Field::AppVersionLength => "app_version length",
            Field::AppVersion => "app_version",
            Field::FileCount => "file count",
            Field::UrlLength => "url length",
            Field::Url => "url",
            Field::ContentVersionLength => "content_version length",
            Field::ContentVersion => "content_version",
            Field::Size => "size",
        }
    }
}

#[derive(Debug)]
enum State {
    /// Expecting `needed` more bytes for `field`; `buf` holds what arrived so far.
    Expecting {
        field: Field,
        needed: usize,
        buf: Vec<u8>,
    },
    Done,
}

impl State {
    fn expect(field: Field, needed: usize) -> Self {
        State::Expecting {
            field,
            needed,
            buf: Vec::with_capacity(needed),
        }
    }
}

/// Incremental decoder for the binary manifest.
///
/// # Example
///
/// ```
/// use mirrorsync::{encode_manifest, FileEntry, Manifest, ManifestDecoder};
///
/// let manifest = Manifest {
///     app_version: "v2".to_string(),
///     files: vec![FileEntry::new("a.txt", "h1", 10)],
/// };
/// let bytes = encode_manifest(&manifest).unwrap();
///
/// let mut decoder = ManifestDecoder::new();
/// for byte in bytes {
///     decoder.push_byte(byte).unwrap();
/// }
/// assert_eq!(decoder.finish().unwrap(), manifest);
/// ```
#[derive(Debug)]
pub struct ManifestDecoder {
    state: State,
    app_version: String,
    files_remaining: u16,
    files: Vec<FileEntry>,
    url: String,
    content_version: String,
}

impl Default for ManifestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestDecoder {
    pub fn new() -> Self {
        Self {
            state: State::expect(Field::AppVersionLength, 2),
            app_version: String::new(),
            files_remaining: 0,
            files: Vec::new(),
            url: String::new(),
            content_version: String::new(),
        }
    }

    /// Whether the full manifest has been read.
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Feeds a single byte.
    ///
    /// Returns `Ok(true)` once this byte completed the manifest.
    pub fn push_byte(&mut self, byte: u8) -> MirrorResult<bool> {
        let consumed = self.feed(&[byte])?;
        Ok(consumed == 1 && self.is_done())
    }

    /// Feeds a chunk and returns how many of its bytes were consumed.
    ///
    /// Fewer than `chunk.len()` bytes are consumed only when the manifest
    /// completes partway through the chunk; the remainder is not part of it.
    pub fn feed(&mut self, chunk: &[u8]) -> MirrorResult<usize> {
        let mut offset = 0;

        loop {
            let (field, complete) = match &mut self.state {
                State::Done => break,
                State::Expecting { field, needed, buf } => {
                    if *needed > 0 {
                        if offset == chunk.len() {
                            break;
                        }
                        let take = (*needed).min(chunk.len() - offset);
                        buf.extend_from_slice(&chunk[offset..offset + take]);
                        *needed -= take;
                        offset += take;
                    }
                    (*field, *needed == 0)
                }
            };

            if complete {
                self.complete_field(field)?;
            }
        }

        Ok(offset)
    }

    /// Consumes the decoder, failing if the stream ended early.
    pub fn finish(self) -> MirrorResult<Manifest> {
        match self.state {
            State::Done => Ok(Manifest {
                app_version: self.app_version,
                files: self.files,
            }),
            State::Expecting { field, needed, .. } => Err(MirrorError::TruncatedStream {
                field: field.name(),
                needed,
            }),
        }
    }

    fn complete_field(&mut self, field: Field) -> MirrorResult<()> {
        let buf = match std::mem::replace(&mut self.state, State::Done) {
            State::Expecting { buf, .. } => buf,
            State::Done => return Ok(()),
        };

        self.state = match field {
            Field::AppVersionLength => string_body(Field::AppVersion, read_u16(&buf)),
            Field::AppVersion => {
                self.app_version = into_string(buf, field)?;
                State::expect(Field::FileCount, 2)
            }
            Field::FileCount => {
                self.files_remaining = read_u16(&buf);
                debug!("reading {} file entries", self.files_remaining);
                self.files.reserve(usize::from(self.files_remaining));
                self.next_entry()
            }
            Field::UrlLength => string_body(Field::Url, read_u16(&buf)),
            Field::Url => {
                self.url = into_string(buf, field)?;
                State::expect(Field::ContentVersionLength, 2)
            }
            Field::ContentVersionLength => string_body(Field::ContentVersion, read_u16(&buf)),
            Field::ContentVersion => {
                self.content_version = into_string(buf, field)?;
                State::expect(Field::Size, 4)
            }
            Field::Size => {
                let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                self.files.push(FileEntry {
                    url: std::mem::take(&mut self.url),
                    content_version: std::mem::take(&mut self.content_version),
                    size,
                });
                self.files_remaining -= 1;
                self.next_entry()
            }
        };
        Ok(())
    }

    fn next_entry(&self) -> State {
        if self.files_remaining == 0 {
            State::Done
        } else {
            State::expect(Field::UrlLength, 2)
        }
    }
}

/// Zero-length strings have no body bytes; `feed` completes them without input.
fn string_body(field: Field, length: u16) -> State {
    State::expect(field, usize::from(length))
}

fn read_u16(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

fn into_string(buf: Vec<u8>, field: Field) -> MirrorResult<String> {
    String::from_utf8(buf).map_err(|e| {
        MirrorError::Protocol(format!("{} is not valid UTF-8: {}", field.name(), e))
    })
}

/// Drives a [`ManifestDecoder`] from a byte stream until the manifest is complete.
///
/// Bytes after the end of the manifest are ignored.
pub async fn decode_stream<S>(mut stream: S) -> MirrorResult<Manifest>
where
    S: Stream<Item = MirrorResult<Bytes>> + Unpin,
{
    let mut decoder = ManifestDecoder::new();
    let mut received = 0usize;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        received += chunk.len();
        let consumed = decoder.feed(&chunk)?;
        if decoder.is_done() {
            if consumed < chunk.len() {
                debug!(
                    "ignoring {} trailing byte(s) after manifest",
                    chunk.len() - consumed
                );
            }
            break;
        }
    }

    let manifest = decoder.finish()?;
    info!(
        "Manifest {} decoded: {} files, {} bytes on the wire",
        manifest.app_version,
        manifest.files.len(),
        received
    );
    Ok(manifest)
}

/// Encodes a manifest in the wire format.
///
/// Fails when a string exceeds 65535 bytes or there are more than 65535 files.
pub fn encode_manifest(manifest: &Manifest) -> MirrorResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(64 + manifest.files.len() * 48);
    put_string(&mut buf, &manifest.app_version)?;

    let count = u16::try_from(manifest.files.len()).map_err(|_| {
        MirrorError::Protocol(format!(
            "too many files for one manifest: {} (max: {})",
            manifest.files.len(),
            u16::MAX
        ))
    })?;
    buf.extend_from_slice(&count.to_le_bytes());

    for file in &manifest.files {
        put_string(&mut buf, &file.url)?;
        put_string(&mut buf, &file.content_version)?;
        buf.extend_from_slice(&file.size.to_le_bytes());
    }
    Ok(buf)
}

fn put_string(buf: &mut Vec<u8>, value: &str) -> MirrorResult<()> {
    let length = u16::try_from(value.len()).map_err(|_| {
        MirrorError::Protocol(format!(
            "string too long to encode: {} bytes (max: {})",
            value.len(),
            u16::MAX
        ))
    })?;
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}
