use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::connector::{ByteRange, Connector};
use crate::progress::ProgressCallback;
use crate::retry::Strategy;
use crate::session::CancelFlag;
use crate::source::FileSource;
use crate::{Error, Result};

const PROGRESS_TICK: Duration = Duration::from_millis(250);

/// A fully downloaded copy of the remote file. The file is removed when this is dropped.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    len: u64,
    name: String,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A fresh reader over the staged bytes.
    pub fn source(&self) -> FileSource {
        FileSource::new(self.name.clone(), &self.path, self.len)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Where and how to stage.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub url: String,
    pub name: String,
    pub strategy: Strategy,
    /// Bytes to fetch, starting at offset 0.
    pub len: u64,
    pub parts: u32,
    pub dir: PathBuf,
    pub read_timeout: Duration,
}

/// Splits `[0, len)` into at most `parts` contiguous inclusive ranges.
pub fn split_ranges(len: u64, parts: u32) -> Vec<ByteRange> {
    if len == 0 {
        return Vec::new();
    }
    let parts = u64::from(parts.max(1)).min(len);
    let part_len = len.div_ceil(parts);
    let mut out = Vec::with_capacity(parts as usize);
    let mut start = 0u64;
    while start < len {
        let end = (start + part_len).min(len) - 1;
        out.push(ByteRange::span(start, end));
        start = end + 1;
    }
    out
}

/// Downloads `plan.len` bytes with concurrent range requests, each part written at its own
/// offset of one file. Requires the server to answer every part with 206.
pub async fn stage_ranges(
    connector: Arc<dyn Connector>,
    plan: StagePlan,
    cancel: CancelFlag,
    progress: &mut dyn ProgressCallback,
) -> Result<StagedFile> {
    tokio::fs::create_dir_all(&plan.dir).await?;
    let path = plan
        .dir
        .join(format!("{}.part", uuid::Uuid::new_v4().simple()));
    let file = tokio::fs::File::create(&path).await?;
    file.set_len(plan.len).await?;
    drop(file);

    let staged = StagedFile {
        path,
        len: plan.len,
        name: plan.name.clone(),
    };

    let ranges = split_ranges(plan.len, plan.parts);
    info!(
        event = "stage.start",
        name = %plan.name,
        len = plan.len,
        parts = ranges.len(),
        strategy = %plan.strategy.name,
        "stage.start"
    );

    let done = Arc::new(AtomicU64::new(0));
    let mut tasks = JoinSet::new();
    for range in ranges {
        let connector = Arc::clone(&connector);
        let url = plan.url.clone();
        let strategy = plan.strategy.clone();
        let path = staged.path.clone();
        let cancel = cancel.clone();
        let done = Arc::clone(&done);
        let read_timeout = plan.read_timeout;
        tasks.spawn(async move {
            fetch_part(
                connector.as_ref(),
                &url,
                &strategy,
                range,
                &path,
                &cancel,
                &done,
                read_timeout,
            )
            .await
        });
    }

    let mut ticker = tokio::time::interval(PROGRESS_TICK);
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Some(Err(e)) => {
                    tasks.abort_all();
                    return Err(Error::Connection {
                        message: format!("stage worker failed: {e}"),
                    });
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = progress
                    .on_progress(done.load(Ordering::Relaxed), Some(plan.len))
                    .await
                {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }
    }

    progress.on_progress(plan.len, Some(plan.len)).await?;
    info!(event = "stage.finish", len = plan.len, "stage.finish");
    Ok(staged)
}

#[allow(clippy::too_many_arguments)]
async fn fetch_part(
    connector: &dyn Connector,
    url: &str,
    strategy: &Strategy,
    range: ByteRange,
    path: &Path,
    cancel: &CancelFlag,
    done: &AtomicU64,
    read_timeout: Duration,
) -> Result<()> {
    let expected = range.end.map_or(0, |end| end - range.start + 1);
    let mut connection = connector.connect(url, strategy, range).await?;
    if connection.status() != 206 {
        return Err(Error::Connection {
            message: format!(
                "range request answered with http {} (expected 206)",
                connection.status()
            ),
        });
    }

    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;

    let mut written = 0u64;
    while written < expected {
        cancel.check()?;
        let chunk = tokio::time::timeout(read_timeout, connection.next_chunk())
            .await
            .map_err(|_| Error::Connection {
                message: format!("range {}-{:?} stalled", range.start, range.end),
            })??;
        let Some(chunk) = chunk else {
            break;
        };
        let take = (expected - written).min(chunk.len() as u64) as usize;
        file.write_all(&chunk[..take]).await?;
        written += take as u64;
        done.fetch_add(take as u64, Ordering::Relaxed);
    }
    file.flush().await?;

    if written != expected {
        return Err(Error::Connection {
            message: format!(
                "range {}-{:?} ended early: {written} of {expected} bytes",
                range.start, range.end
            ),
        });
    }
    debug!(
        event = "stage.part_done",
        start = range.start,
        bytes = written,
        "stage.part_done"
    );
    Ok(())
}
