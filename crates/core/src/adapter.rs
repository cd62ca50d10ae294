use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::connector::{ByteRange, Connection, Connector};
use crate::retry::{ReadRetry, RetryPolicy, Strategy};
use crate::session::CancelFlag;
use crate::source::{PullSource, SourceLength};
use crate::{Error, Result};

pub const DEFAULT_PROBE_BYTES: usize = 1024;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// What to fetch and under which limits.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub name: String,
    /// Upper bound on bytes handed to the consumer.
    pub max_bytes: u64,
    pub probe_bytes: usize,
    pub start_offset: u64,
    pub read_timeout: Duration,
    pub read_retry: ReadRetry,
}

impl TransferRequest {
    pub fn new(url: impl Into<String>, name: impl Into<String>, max_bytes: u64) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            max_bytes,
            probe_bytes: DEFAULT_PROBE_BYTES,
            start_offset: 0,
            read_timeout: DEFAULT_READ_TIMEOUT,
            read_retry: ReadRetry::default(),
        }
    }

    pub fn with_probe_bytes(mut self, probe_bytes: usize) -> Self {
        self.probe_bytes = probe_bytes.max(1);
        self
    }

    pub fn with_start_offset(mut self, start_offset: u64) -> Self {
        self.start_offset = start_offset;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_read_retry(mut self, read_retry: ReadRetry) -> Self {
        self.read_retry = read_retry;
        self
    }
}

/// Counters for one transfer. Lives exactly as long as its adapter.
#[derive(Debug, Clone)]
pub struct TransferState {
    bytes_transferred: u64,
    total_size: Option<u64>,
    started_at: Instant,
    truncated: bool,
}

impl TransferState {
    fn new() -> Self {
        Self {
            bytes_transferred: 0,
            total_size: None,
            started_at: Instant::now(),
            truncated: false,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// `Content-Length` of the adopted response, if the server sent one.
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// True once the byte bound cut off data the server still had.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

struct Probe {
    connection: Box<dyn Connection>,
    data: Bytes,
    eof: bool,
}

/// Turns a direct URL into a [`PullSource`], trying each strategy of a [`RetryPolicy`] until one
/// proves that data is flowing.
pub struct TransferAdapter {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    request: TransferRequest,
    cancel: CancelFlag,
    state: TransferState,
    connection: Option<Box<dyn Connection>>,
    pending: Bytes,
    adopted: Option<usize>,
    accepts_ranges: bool,
    eof: bool,
    bound_checked: bool,
    overflow_seen: u64,
    /// Stalls retried so far; the budget covers the whole transfer.
    read_stalls: u32,
    closed: bool,
}

impl TransferAdapter {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
        request: TransferRequest,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            connector,
            policy,
            request,
            cancel,
            state: TransferState::new(),
            connection: None,
            pending: Bytes::new(),
            adopted: None,
            accepts_ranges: false,
            eof: false,
            bound_checked: false,
            overflow_seen: 0,
            read_stalls: 0,
            closed: false,
        }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    pub fn adopted_strategy(&self) -> Option<&Strategy> {
        self.adopted.and_then(|i| self.policy.strategies().get(i))
    }

    /// Whether the adopted server advertised byte-range support.
    pub fn supports_ranges(&self) -> bool {
        self.accepts_ranges
    }

    pub fn bound(&self) -> u64 {
        self.request.max_bytes
    }

    /// Server body fully consumed.
    pub fn is_exhausted(&self) -> bool {
        self.eof && self.pending.is_empty()
    }

    /// `SizeExceeded` describing the cut, when the bound truncated the transfer.
    pub fn truncation(&self) -> Option<Error> {
        if !self.state.truncated {
            return None;
        }
        let size = self.state.total_size.unwrap_or(
            self.state
                .bytes_transferred
                .saturating_add(self.overflow_seen),
        );
        Some(Error::SizeExceeded {
            size,
            limit: self.request.max_bytes,
        })
    }

    async fn open_inner(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Connection {
                message: format!("transfer source already closed: {}", self.request.name),
            });
        }
        if self.adopted.is_some() {
            return Ok(());
        }

        let mut adopted = None;
        for (index, strategy) in self.policy.strategies().iter().enumerate() {
            self.cancel.check()?;
            debug!(
                event = "adapter.strategy_attempt",
                strategy = %strategy.name,
                attempt = index + 1,
                offset = self.request.start_offset,
                "adapter.strategy_attempt"
            );

            match probe(self.connector.as_ref(), &self.request, strategy).await {
                Ok(p) => {
                    adopted = Some((index, p));
                    break;
                }
                Err(e) => {
                    warn!(
                        event = "adapter.probe_failed",
                        strategy = %strategy.name,
                        error = %e,
                        "adapter.probe_failed"
                    );
                }
            }
        }

        let Some((index, p)) = adopted else {
            return Err(Error::ResolutionExhausted {
                attempts: self.policy.len(),
            });
        };

        self.state.total_size = p.connection.content_length();
        self.accepts_ranges = p.connection.accepts_ranges();
        self.pending = p.data;
        self.eof = p.eof;
        self.connection = if p.eof { None } else { Some(p.connection) };
        self.adopted = Some(index);

        info!(
            event = "adapter.probe_ok",
            strategy = %self.policy.strategies()[index].name,
            probe_bytes = self.pending.len(),
            total_size = ?self.state.total_size,
            accepts_ranges = self.accepts_ranges,
            "adapter.probe_ok"
        );
        Ok(())
    }

    async fn read_inner(&mut self, max_bytes: usize) -> Result<Bytes> {
        if self.closed || max_bytes == 0 {
            return Ok(Bytes::new());
        }
        if self.adopted.is_none() {
            self.open_inner().await?;
        }
        self.cancel.check()?;

        let remaining = self
            .request
            .max_bytes
            .saturating_sub(self.state.bytes_transferred);
        if remaining == 0 {
            self.on_bound_reached().await;
            return Ok(Bytes::new());
        }
        let want = (max_bytes as u64).min(remaining) as usize;

        let chunk = if !self.pending.is_empty() {
            let n = want.min(self.pending.len());
            self.pending.split_to(n)
        } else {
            match self.next_chunk().await? {
                Some(mut c) => {
                    if c.len() > want {
                        self.pending = c.split_off(want);
                    }
                    c
                }
                None => Bytes::new(),
            }
        };

        self.cancel.check()?;
        self.state.bytes_transferred += chunk.len() as u64;
        Ok(chunk)
    }

    /// Next non-empty chunk from the adopted connection. Stalls are retried on the same
    /// connection with linear backoff until the transfer's retry budget is spent; any other
    /// failure is returned as is.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let retry = self.request.read_retry;
        let read_timeout = self.request.read_timeout;
        let Some(connection) = self.connection.as_mut() else {
            return Ok(None);
        };

        let next = loop {
            match tokio::time::timeout(read_timeout, connection.next_chunk()).await {
                Ok(Ok(Some(c))) if c.is_empty() => continue,
                Ok(Ok(Some(c))) => break Some(c),
                Ok(Ok(None)) => break None,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    self.read_stalls += 1;
                    if self.read_stalls > retry.max_retries() {
                        return Err(Error::Connection {
                            message: format!(
                                "read stalled for {}s, gave up after {} retries",
                                read_timeout.as_secs_f64(),
                                retry.max_retries()
                            ),
                        });
                    }
                    let delay = retry.delay(self.read_stalls);
                    warn!(
                        event = "adapter.read_retry",
                        attempt = self.read_stalls,
                        delay_ms = delay.as_millis() as u64,
                        bytes_transferred = self.state.bytes_transferred,
                        "adapter.read_retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
            }
        };

        if next.is_none() {
            self.connection = None;
            self.eof = true;
        }
        Ok(next)
    }

    async fn on_bound_reached(&mut self) {
        if self.bound_checked {
            return;
        }
        self.bound_checked = true;

        if !self.pending.is_empty() {
            self.overflow_seen = self.pending.len() as u64;
        } else if self
            .state
            .total_size
            .is_some_and(|total| total > self.state.bytes_transferred)
        {
            self.overflow_seen = 1;
        } else if let Some(connection) = self.connection.as_mut() {
            // One bounded peek decides whether the server had more to give.
            if let Ok(Ok(Some(c))) =
                tokio::time::timeout(self.request.read_timeout, connection.next_chunk()).await
            {
                self.overflow_seen = c.len() as u64;
            }
        }

        self.pending = Bytes::new();
        self.connection = None;
        if self.overflow_seen > 0 {
            self.state.truncated = true;
            info!(
                event = "adapter.truncated",
                bound = self.request.max_bytes,
                total_size = ?self.state.total_size,
                "adapter.truncated"
            );
        }
    }
}

async fn probe(
    connector: &dyn Connector,
    request: &TransferRequest,
    strategy: &Strategy,
) -> Result<Probe> {
    let range = ByteRange::from_offset(request.start_offset);
    let mut connection = connector.connect(&request.url, strategy, range).await?;

    let status = connection.status();
    let accepted = if request.start_offset > 0 {
        status == 206
    } else {
        status == 200 || status == 206
    };
    if !accepted {
        return Err(Error::Connection {
            message: format!("unexpected http status {status}"),
        });
    }

    let mut buf = BytesMut::new();
    let mut eof = false;
    let fill = async {
        while buf.len() < request.probe_bytes {
            match connection.next_chunk().await? {
                Some(c) => buf.extend_from_slice(&c),
                None => {
                    eof = true;
                    break;
                }
            }
        }
        Ok::<(), Error>(())
    };
    tokio::time::timeout(request.read_timeout, fill)
        .await
        .map_err(|_| Error::Connection {
            message: format!(
                "probe read stalled for {}s",
                request.read_timeout.as_secs_f64()
            ),
        })??;

    if buf.is_empty() {
        return Err(Error::Connection {
            message: "probe read returned no data".to_string(),
        });
    }

    Ok(Probe {
        connection,
        data: buf.freeze(),
        eof,
    })
}

impl PullSource for TransferAdapter {
    fn name(&self) -> &str {
        &self.request.name
    }

    fn length(&self) -> SourceLength {
        match self.state.total_size {
            Some(total) => SourceLength::Declared(total.min(self.request.max_bytes)),
            None => SourceLength::Unknown,
        }
    }

    fn open<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.open_inner())
    }

    fn read<'a>(
        &'a mut self,
        max_bytes: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + 'a>> {
        Box::pin(self.read_inner(max_bytes))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.connection = None;
        self.pending = Bytes::new();
        debug!(
            event = "adapter.closed",
            bytes_transferred = self.state.bytes_transferred,
            "adapter.closed"
        );
    }
}
