//! Per-run NDJSON log files.
//!
//! One process-wide JSON `tracing` layer writes into whichever run file is currently open.
//! Between runs its output is discarded.

use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Older files of the same kind beyond this count are removed when a run starts.
pub const KEEP_RUN_LOGS: usize = 50;

const DEFAULT_FILTER: &str = "info,tgrelay_core=debug";

static ACTIVE: OnceLock<ActiveLog> = OnceLock::new();
static SUBSCRIBER: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// One relay started from the CLI.
    Relay,
    /// One daemon lifetime; every relay it serves shares the file.
    Daemon,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relay => "relay",
            Self::Daemon => "daemon",
        }
    }
}

/// What a run log file is named after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLogName {
    pub kind: RunKind,
    pub run_id: String,
    /// `<identity>@<source host>` for relays.
    pub subject: Option<String>,
}

impl RunLogName {
    pub fn relay(run_id: impl Into<String>, identity: &str, source_url: &str) -> Self {
        let host = reqwest::Url::parse(source_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            kind: RunKind::Relay,
            run_id: run_id.into(),
            subject: Some(format!("{identity}@{host}")),
        }
    }

    pub fn daemon(run_id: impl Into<String>) -> Self {
        Self {
            kind: RunKind::Daemon,
            run_id: run_id.into(),
            subject: None,
        }
    }

    /// `<kind>[-<subject>]-<UTC>-<run_id>.ndjson`, every component reduced to safe characters.
    pub fn file_name(&self, started_at: DateTime<Utc>) -> String {
        let mut parts = vec![self.kind.as_str().to_string()];
        if let Some(subject) = &self.subject {
            parts.push(safe_component(subject));
        }
        parts.push(started_at.format("%Y%m%dT%H%M%SZ").to_string());
        parts.push(safe_component(&self.run_id));
        format!("{}.ndjson", parts.join("-"))
    }
}

#[derive(Debug, Default)]
struct ActiveLog {
    file: Mutex<Option<LineWriter<File>>>,
}

impl ActiveLog {
    fn file(&self) -> MutexGuard<'_, Option<LineWriter<File>>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, path: &Path) -> std::io::Result<()> {
        let mut slot = self.file();
        if slot.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "a run log is already open",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *slot = Some(LineWriter::new(file));
        Ok(())
    }

    fn close(&self) -> std::io::Result<()> {
        let Some(mut writer) = self.file().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

/// Borrow of the open run file for one formatted event.
struct RunLogLine<'a>(MutexGuard<'a, Option<LineWriter<File>>>);

impl Write for RunLogLine<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for ActiveLog {
    type Writer = RunLogLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogLine(self.file())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &ActiveLog {
    type Writer = RunLogLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogLine((**self).file())
    }
}

fn env_filter_from(tgrelay_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    tgrelay_log
        .or(rust_log)
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the JSON subscriber once per process. Safe to call repeatedly.
pub fn init_run_logging() {
    SUBSCRIBER.get_or_init(|| {
        let active = ACTIVE.get_or_init(ActiveLog::default);
        let filter = env_filter_from(
            std::env::var("TGRELAY_LOG").ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(active);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init();
    });
}

/// Keeps the run file open; dropping it flushes and closes the file.
#[derive(Debug)]
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(active) = ACTIVE.get() {
            let _ = active.close();
        }
    }
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    match std::env::var_os("TGRELAY_LOG_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => data_dir.join("logs"),
    }
}

pub fn start_run_log(name: &RunLogName, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    init_run_logging();

    let dir = log_dir(data_dir);
    std::fs::create_dir_all(&dir)?;
    prune_run_logs(&dir, name.kind, KEEP_RUN_LOGS.saturating_sub(1))?;

    let path = dir.join(name.file_name(Utc::now()));
    ACTIVE.get_or_init(ActiveLog::default).open(&path)?;
    Ok(RunLogGuard { path })
}

/// Removes the oldest `<kind>-*.ndjson` files in `dir` until at most `keep` remain.
pub fn prune_run_logs(dir: &Path, kind: RunKind, keep: usize) -> std::io::Result<usize> {
    let prefix = format!("{}-", kind.as_str());
    let mut logs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with(&prefix) && name.ends_with(".ndjson")) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        logs.push((modified, entry.path()));
    }
    if logs.len() <= keep {
        return Ok(0);
    }

    logs.sort();
    let excess = logs.len() - keep;
    for (_, path) in logs.iter().take(excess) {
        std::fs::remove_file(path)?;
    }
    Ok(excess)
}

fn safe_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '@' => c,
            _ => '_',
        })
        .collect()
}
