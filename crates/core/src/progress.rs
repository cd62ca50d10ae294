use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::Result;
use crate::session::CancelFlag;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);

const BAR_WIDTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Download,
    Upload,
}

impl Phase {
    fn verb(&self) -> &'static str {
        match self {
            Self::Download => "Downloading",
            Self::Upload => "Uploading",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub phase: Phase,
    /// Pass over the bytes within this phase, from 1. A new pass counts from zero again.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    pub name: String,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    /// `None` when the total is unknown.
    pub percent: Option<f64>,
    pub bytes_per_second: f64,
    /// `None` when the total is unknown; 0 when nothing has moved yet.
    pub eta_seconds: Option<u64>,
    pub elapsed_seconds: f64,
}

fn first_attempt() -> u32 {
    1
}

impl ProgressSnapshot {
    pub fn compute(
        phase: Phase,
        name: &str,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
        elapsed: Duration,
    ) -> Self {
        let total_bytes = total_bytes.filter(|t| *t > 0);
        let elapsed_seconds = elapsed.as_secs_f64();
        let bytes_per_second = if elapsed_seconds > 0.0 {
            bytes_transferred as f64 / elapsed_seconds
        } else {
            0.0
        };

        let percent =
            total_bytes.map(|t| (bytes_transferred as f64 / t as f64 * 100.0).min(100.0));
        let eta_seconds = total_bytes.map(|t| {
            if bytes_per_second <= 0.0 {
                return 0;
            }
            let left = t.saturating_sub(bytes_transferred) as f64;
            (left / bytes_per_second).ceil() as u64
        });

        Self {
            phase,
            attempt: first_attempt(),
            name: name.to_string(),
            bytes_transferred,
            total_bytes,
            percent,
            bytes_per_second,
            eta_seconds,
            elapsed_seconds,
        }
    }
}

/// Renders the single status message shown to the user.
pub fn format_status(p: &ProgressSnapshot) -> String {
    let bar = match p.percent {
        Some(pct) => {
            let filled = ((pct / 100.0) * BAR_WIDTH as f64).round() as usize;
            let filled = filled.min(BAR_WIDTH);
            format!(
                "[{}{}] {pct:.1}%",
                "█".repeat(filled),
                "░".repeat(BAR_WIDTH - filled)
            )
        }
        None => "[??????????] unknown".to_string(),
    };

    let total = p
        .total_bytes
        .map(|t| bytesize::to_string(t, true))
        .unwrap_or_else(|| "unknown".to_string());
    let eta = p
        .eta_seconds
        .map(format_eta)
        .unwrap_or_else(|| "unknown".to_string());

    let attempt = if p.attempt > 1 {
        format!(" (attempt {})", p.attempt)
    } else {
        String::new()
    };

    format!(
        "{} {}{attempt}\n{bar}\n{} / {total} @ {}/s, ETA {eta}",
        p.phase.verb(),
        p.name,
        bytesize::to_string(p.bytes_transferred, true),
        bytesize::to_string(p.bytes_per_second as u64, true),
    )
}

fn format_eta(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// Synchronous observer of every emitted snapshot (NDJSON output, tests).
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: ProgressSnapshot);
}

/// Something that can display and replace one status message.
pub trait StatusSink: Send + Sync {
    fn show<'a>(&'a self, text: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn clear<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Callback a chat transport invokes while it uploads.
pub trait ProgressCallback: Send {
    fn on_progress<'a>(
        &'a mut self,
        current: u64,
        total: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Writes status text to the log instead of a chat.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn show<'a>(&'a self, text: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            info!(event = "progress.status", text, "progress.status");
            Ok(())
        })
    }

    fn clear<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// Throttled progress reporting for one transfer.
///
/// At most one update per interval reaches the status sink, except the 100% update which is
/// always emitted once. Reported byte counts never go backwards. Sink failures are logged and
/// dropped. Each checkpoint observes the cancel flag.
pub struct ProgressReporter {
    phase: Phase,
    attempt: u32,
    name: String,
    status: Arc<dyn StatusSink>,
    observer: Option<Arc<dyn ProgressSink>>,
    cancel: CancelFlag,
    interval: Duration,
    started_at: Instant,
    last_emit: Option<Instant>,
    last_bytes: u64,
    last_total: Option<u64>,
    final_sent: bool,
    updates: u64,
}

impl ProgressReporter {
    pub fn new(name: impl Into<String>, status: Arc<dyn StatusSink>, cancel: CancelFlag) -> Self {
        Self {
            phase: Phase::Upload,
            attempt: first_attempt(),
            name: name.into(),
            status,
            observer: None,
            cancel,
            interval: DEFAULT_INTERVAL,
            started_at: Instant::now(),
            last_emit: None,
            last_bytes: 0,
            last_total: None,
            final_sent: false,
            updates: 0,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Labels a repeated pass so its restart from zero shows as a new attempt.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    pub fn with_observer(mut self, observer: Option<Arc<dyn ProgressSink>>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_started_at(mut self, started_at: Instant) -> Self {
        self.started_at = started_at;
        self
    }

    /// Number of updates pushed to the status sink so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn last_reported(&self) -> u64 {
        self.last_bytes
    }

    pub async fn checkpoint(&mut self, current: u64, total: Option<u64>) -> Result<()> {
        self.cancel.check()?;

        let current = current.max(self.last_bytes);
        self.last_bytes = current;
        if total.is_some() {
            self.last_total = total;
        }

        let complete = total.is_some_and(|t| t > 0 && current >= t);
        if complete {
            if self.final_sent {
                return Ok(());
            }
            self.final_sent = true;
        } else if self
            .last_emit
            .is_some_and(|last| last.elapsed() < self.interval)
        {
            return Ok(());
        }

        self.emit(current, total).await;
        Ok(())
    }

    /// Forces the final update. A transfer of unknown size reports what was actually moved as
    /// its total.
    pub async fn finish(&mut self) {
        if self.final_sent {
            return;
        }
        self.final_sent = true;
        let total = self.last_total.or(Some(self.last_bytes));
        self.emit(self.last_bytes, total).await;
    }

    async fn emit(&mut self, current: u64, total: Option<u64>) {
        let snapshot = ProgressSnapshot {
            attempt: self.attempt,
            ..ProgressSnapshot::compute(
                self.phase,
                &self.name,
                current,
                total,
                self.started_at.elapsed(),
            )
        };
        if let Some(observer) = &self.observer {
            observer.on_progress(snapshot.clone());
        }

        let text = format_status(&snapshot);
        if let Err(e) = self.status.show(&text).await {
            warn!(event = "progress.sink_failed", error = %e, "progress.sink_failed");
        }
        self.last_emit = Some(Instant::now());
        self.updates += 1;
    }
}

impl ProgressCallback for ProgressReporter {
    fn on_progress<'a>(
        &'a mut self,
        current: u64,
        total: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.checkpoint(current, total))
    }
}
