use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

use crate::progress::ProgressCallback;
use crate::source::PullSource;
use crate::{Error, Result};

mod telegram_botapi;

pub use telegram_botapi::{TelegramBotApi, TelegramBotApiTransport, TelegramStatusMessage};

/// Max bytes pulled from a source per read when uploading.
pub const DEFAULT_CHUNK_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Video,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Document => "document",
        }
    }

    /// Bot API method that uploads this kind.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Video => "sendVideo",
            Self::Document => "sendDocument",
        }
    }

    /// The generic kind to retry with once this one is refused.
    pub fn fallback(&self) -> Option<MediaKind> {
        match self {
            Self::Video => Some(Self::Document),
            Self::Document => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "video" => Ok(Self::Video),
            "document" => Ok(Self::Document),
            other => Err(Error::InvalidConfig {
                message: format!("unknown media kind: {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message_id: i64,
    pub kind: MediaKind,
    pub file_id: Option<String>,
    pub bytes: u64,
}

/// Uploads a [`PullSource`] as a chat attachment.
///
/// The transport borrows the source; opening it is the transport's job, closing it is the
/// owner's. `progress` is awaited after every chunk and an error from it aborts the upload.
pub trait ChatTransport: Send + Sync {
    fn provider(&self) -> &'static str;

    fn send<'a>(
        &'a self,
        destination: &'a str,
        source: &'a mut dyn PullSource,
        kind: MediaKind,
        caption: &'a str,
        progress: &'a mut dyn ProgressCallback,
    ) -> Pin<Box<dyn Future<Output = Result<SentMessage>> + Send + 'a>>;
}

pub(crate) type BodyItem = std::result::Result<Bytes, std::io::Error>;

/// Moves bytes from `source` into `tx` until end of stream. A read or progress failure is also
/// pushed into the channel so the receiving body aborts instead of completing short. Returns the
/// number of bytes handed over; stops quietly if the receiver went away.
pub(crate) async fn pump(
    source: &mut dyn PullSource,
    chunk_bytes: usize,
    progress: &mut dyn ProgressCallback,
    tx: mpsc::Sender<BodyItem>,
) -> Result<u64> {
    let total = source.length().declared();
    let mut sent = 0u64;

    let abort = |e: &Error| std::io::Error::other(e.to_string());

    if let Err(e) = progress.on_progress(0, total).await {
        let _ = tx.send(Err(abort(&e))).await;
        return Err(e);
    }

    loop {
        let chunk = match source.read(chunk_bytes).await {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(abort(&e))).await;
                return Err(e);
            }
        };
        if chunk.is_empty() {
            break;
        }
        sent += chunk.len() as u64;
        if let Some(declared) = total
            && sent > declared
        {
            let e = length_mismatch(sent, declared);
            let _ = tx.send(Err(abort(&e))).await;
            return Err(e);
        }
        if tx.send(Ok(chunk)).await.is_err() {
            return Ok(sent);
        }
        if let Err(e) = progress.on_progress(sent, total).await {
            let _ = tx.send(Err(abort(&e))).await;
            return Err(e);
        }
    }
    if let Some(declared) = total
        && sent != declared
    {
        let e = length_mismatch(sent, declared);
        let _ = tx.send(Err(abort(&e))).await;
        return Err(e);
    }
    Ok(sent)
}

/// A declared part length is sent ahead of the bytes; a different count corrupts the upload.
fn length_mismatch(sent: u64, declared: u64) -> Error {
    Error::Connection {
        message: format!("source delivered {sent} bytes but declared {declared}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub destination: String,
    pub kind: MediaKind,
    pub caption: String,
    pub name: String,
    pub bytes: u64,
    /// Empty unless the transport keeps payloads.
    pub data: Vec<u8>,
}

/// Transport that keeps uploads in memory. Used for dry runs and tests.
#[derive(Debug)]
pub struct InMemoryTransport {
    pub uploaded: AtomicUsize,
    chunk_bytes: usize,
    keep_data: bool,
    reject: HashSet<MediaKind>,
    next_id: AtomicI64,
    inner: Mutex<Vec<StoredUpload>>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            uploaded: AtomicUsize::new(0),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            keep_data: true,
            reject: HashSet::new(),
            next_id: AtomicI64::new(1),
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Counts bytes without keeping them.
    pub fn discarding() -> Self {
        Self {
            keep_data: false,
            ..Self::new()
        }
    }

    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }

    /// Refuses every upload of `kind` after consuming it, like Bot API does for bad media.
    pub fn rejecting(mut self, kind: MediaKind) -> Self {
        self.reject.insert(kind);
        self
    }

    pub async fn uploads(&self) -> Vec<StoredUpload> {
        self.inner.lock().await.clone()
    }
}

impl ChatTransport for InMemoryTransport {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn send<'a>(
        &'a self,
        destination: &'a str,
        source: &'a mut dyn PullSource,
        kind: MediaKind,
        caption: &'a str,
        progress: &'a mut dyn ProgressCallback,
    ) -> Pin<Box<dyn Future<Output = Result<SentMessage>> + Send + 'a>> {
        Box::pin(async move {
            source.open().await?;
            let name = source.name().to_string();

            let (tx, mut rx) = mpsc::channel::<BodyItem>(4);
            let keep_data = self.keep_data;
            let collect = async move {
                let mut data = Vec::new();
                let mut bytes = 0u64;
                while let Some(item) = rx.recv().await {
                    let chunk = item.map_err(|e| Error::Telegram {
                        message: format!("upload body aborted: {e}"),
                    })?;
                    bytes += chunk.len() as u64;
                    if keep_data {
                        data.extend_from_slice(&chunk);
                    }
                }
                Ok::<_, Error>((bytes, data))
            };

            let (pumped, collected) =
                tokio::join!(pump(source, self.chunk_bytes, progress, tx), collect);
            pumped?;
            let (bytes, data) = collected?;

            if self.reject.contains(&kind) {
                return Err(Error::TransportRejected {
                    kind,
                    message: format!("{} not accepted for {name}", kind.method()),
                });
            }

            let message_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.inner.lock().await.push(StoredUpload {
                destination: destination.to_string(),
                kind,
                caption: caption.to_string(),
                name,
                bytes,
                data,
            });
            self.uploaded.fetch_add(1, Ordering::Relaxed);

            Ok(SentMessage {
                message_id,
                kind,
                file_id: Some(format!("mem:{}", uuid::Uuid::new_v4())),
                bytes,
            })
        })
    }
}
