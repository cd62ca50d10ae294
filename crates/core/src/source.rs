use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::{Error, Result};

/// Length a source advertises to its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLength {
    Declared(u64),
    Unknown,
}

impl SourceLength {
    pub fn declared(self) -> Option<u64> {
        match self {
            Self::Declared(n) => Some(n),
            Self::Unknown => None,
        }
    }

    /// Declared length, or `estimate` for consumers that insist on a number.
    pub fn or_estimate(self, estimate: u64) -> u64 {
        self.declared().unwrap_or(estimate)
    }
}

/// A byte producer the chat transport pulls from.
///
/// Contract:
/// - `open` establishes the underlying connection and is a no-op once it succeeded.
/// - `read(max)` returns at most `max` bytes; an empty result means end of stream.
/// - `close` releases the connection; it may be called any number of times, and every
///   `read` after it returns an empty result.
pub trait PullSource: Send {
    fn name(&self) -> &str;

    fn length(&self) -> SourceLength;

    fn open<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn read<'a>(
        &'a mut self,
        max_bytes: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + 'a>>;

    fn close(&mut self);
}

/// Serves an in-memory buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Bytes,
    pos: usize,
    closed: bool,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            pos: 0,
            closed: false,
        }
    }
}

impl PullSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn length(&self) -> SourceLength {
        SourceLength::Declared(self.data.len() as u64)
    }

    fn open<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn read<'a>(
        &'a mut self,
        max_bytes: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + 'a>> {
        Box::pin(async move {
            if self.closed || self.pos >= self.data.len() {
                return Ok(Bytes::new());
            }
            let end = self.pos.saturating_add(max_bytes).min(self.data.len());
            let out = self.data.slice(self.pos..end);
            self.pos = end;
            Ok(out)
        })
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Reads a file staged on local disk.
#[derive(Debug)]
pub struct FileSource {
    name: String,
    path: PathBuf,
    len: u64,
    file: Option<tokio::fs::File>,
    read: u64,
    closed: bool,
}

impl FileSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, len: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            len,
            file: None,
            read: 0,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PullSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn length(&self) -> SourceLength {
        SourceLength::Declared(self.len)
    }

    fn open<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.closed {
                return Err(Error::Connection {
                    message: format!("source already closed: {}", self.path.display()),
                });
            }
            if self.file.is_none() {
                self.file = Some(tokio::fs::File::open(&self.path).await?);
            }
            Ok(())
        })
    }

    fn read<'a>(
        &'a mut self,
        max_bytes: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + 'a>> {
        Box::pin(async move {
            if self.closed || self.read >= self.len || max_bytes == 0 {
                return Ok(Bytes::new());
            }
            if self.file.is_none() {
                self.open().await?;
            }
            let Some(file) = self.file.as_mut() else {
                return Ok(Bytes::new());
            };

            let want = (self.len - self.read).min(max_bytes as u64) as usize;
            let mut buf = vec![0u8; want];
            let n = file.read(&mut buf).await?;
            buf.truncate(n);
            self.read += n as u64;
            Ok(Bytes::from(buf))
        })
    }

    fn close(&mut self) {
        self.file = None;
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_source_reads_in_bounded_chunks() {
        let mut src = MemorySource::new("a.bin", b"0123456789".to_vec());
        src.open().await.unwrap();
        assert_eq!(src.length(), SourceLength::Declared(10));

        assert_eq!(&src.read(4).await.unwrap()[..], b"0123");
        assert_eq!(&src.read(4).await.unwrap()[..], b"4567");
        assert_eq!(&src.read(4).await.unwrap()[..], b"89");
        assert!(src.read(4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_source_close_is_idempotent_and_ends_stream() {
        let mut src = MemorySource::new("a.bin", b"abc".to_vec());
        src.close();
        src.close();
        assert!(src.read(16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_source_reads_whole_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("staged.bin");
        std::fs::write(&path, vec![9u8; 10_000]).unwrap();

        let mut src = FileSource::new("staged.bin", &path, 10_000);
        src.open().await.unwrap();

        let mut total = 0usize;
        loop {
            let chunk = src.read(4096).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            assert!(chunk.len() <= 4096);
            total += chunk.len();
        }
        assert_eq!(total, 10_000);

        src.close();
        src.close();
        assert!(src.read(4096).await.unwrap().is_empty());
    }

    #[test]
    fn unknown_length_uses_estimate() {
        assert_eq!(SourceLength::Unknown.or_estimate(42), 42);
        assert_eq!(SourceLength::Declared(7).or_estimate(42), 7);
        assert_eq!(SourceLength::Unknown.declared(), None);
    }
}
