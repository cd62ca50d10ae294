use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::adapter::{TransferAdapter, TransferRequest};
use crate::config::{OversizePolicy, Settings, StagingMode};
use crate::connector::Connector;
use crate::progress::{Phase, ProgressReporter, ProgressSink, StatusSink};
use crate::resolver::{LinkResolver, ResolvedLink};
use crate::retry::{ReadRetry, RetryPolicy};
use crate::session::{CancelFlag, SessionGuard, SessionRegistry};
use crate::source::{FileSource, PullSource};
use crate::stage::{StagePlan, StagedFile, stage_ranges};
use crate::transport::{ChatTransport, MediaKind, SentMessage};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub chunk_bytes: usize,
    pub probe_bytes: usize,
    pub max_bytes: u64,
    pub oversize: OversizePolicy,
    pub read_timeout: Duration,
    pub read_retry: ReadRetry,
    pub staging: StagingMode,
    pub stage_parts: u32,
    pub staging_dir: PathBuf,
    pub progress_interval: Duration,
}

impl RelayOptions {
    pub fn from_settings(settings: &Settings, data_dir: &Path) -> Self {
        let t = &settings.transfer;
        Self {
            chunk_bytes: t.chunk_bytes as usize,
            probe_bytes: t.probe_bytes as usize,
            max_bytes: t.max_bytes,
            oversize: t.oversize,
            read_timeout: Duration::from_secs(t.read_timeout_secs),
            read_retry: settings.read_retry(),
            staging: t.staging,
            stage_parts: t.stage_parts,
            staging_dir: data_dir.join("staging"),
            progress_interval: settings.progress_interval(),
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), &std::env::temp_dir().join(crate::APP_NAME))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    /// Who asked; at most one active relay per identity.
    pub identity: String,
    pub source_url: String,
    pub destination: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayReport {
    pub identity: String,
    pub name: String,
    pub resolver: String,
    pub strategy: Option<String>,
    pub requested_kind: MediaKind,
    pub kind: MediaKind,
    pub fallback_used: bool,
    pub staged: bool,
    pub bytes_delivered: u64,
    pub total_bytes: Option<u64>,
    pub truncated: bool,
    pub message_id: i64,
    pub file_id: Option<String>,
    pub elapsed_seconds: f64,
}

pub fn truncation_note(delivered: u64, limit: u64) -> String {
    format!(
        "Note: file exceeds the {} upload limit; only the first {} were delivered.",
        bytesize::to_string(limit, true),
        bytesize::to_string(delivered, true)
    )
}

fn session_outcome(e: &Error) -> &'static str {
    match e {
        Error::Cancelled => "cancelled",
        _ => "failed",
    }
}

enum Payload {
    Stream(TransferAdapter),
    Staged(FileSource),
}

impl Payload {
    fn source(&mut self) -> &mut dyn PullSource {
        match self {
            Self::Stream(a) => a,
            Self::Staged(f) => f,
        }
    }

    fn truncated(&self) -> bool {
        match self {
            Self::Stream(a) => a.state().truncated(),
            Self::Staged(_) => false,
        }
    }
}

struct Delivery {
    sent: SentMessage,
    fallback_used: bool,
    truncated_late: bool,
}

/// Resolve, fetch and upload one link, end to end.
pub struct Relay {
    resolver: Arc<dyn LinkResolver>,
    connector: Arc<dyn Connector>,
    transport: Arc<dyn ChatTransport>,
    policy: RetryPolicy,
    options: RelayOptions,
    observer: Option<Arc<dyn ProgressSink>>,
}

impl Relay {
    pub fn new(
        resolver: Arc<dyn LinkResolver>,
        connector: Arc<dyn Connector>,
        transport: Arc<dyn ChatTransport>,
        policy: RetryPolicy,
        options: RelayOptions,
    ) -> Self {
        Self {
            resolver,
            connector,
            transport,
            policy,
            options,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressSink>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    pub async fn run(
        &self,
        registry: &Arc<SessionRegistry>,
        request: RelayRequest,
        status: Arc<dyn StatusSink>,
    ) -> Result<RelayReport> {
        let guard = match registry.begin(&request.identity) {
            Ok(guard) => guard,
            Err(e) => {
                let _ = status.show(&e.user_message()).await;
                return Err(e);
            }
        };
        self.run_with_guard(guard, request, status).await
    }

    /// Runs a relay for a session that was already marked active.
    pub async fn run_with_guard(
        &self,
        guard: SessionGuard,
        request: RelayRequest,
        status: Arc<dyn StatusSink>,
    ) -> Result<RelayReport> {
        let started = Instant::now();
        info!(
            event = "relay.start",
            identity = %request.identity,
            resolver = self.resolver.name(),
            transport = self.transport.provider(),
            kind = %request.kind,
            "relay.start"
        );

        let cancel = guard.cancel_flag().clone();
        let result = match self.relay(&request, &cancel, &status, started).await {
            Err(_) if cancel.is_cancelled() => Err(Error::Cancelled),
            other => other,
        };

        let shown = match &result {
            Ok(report) if report.truncated => status
                .show(&truncation_note(report.bytes_delivered, self.options.max_bytes))
                .await,
            Ok(_) => status.clear().await,
            Err(e) => status.show(&e.user_message()).await,
        };
        if let Err(e) = shown {
            warn!(event = "progress.sink_failed", error = %e, "progress.sink_failed");
        }

        match &result {
            Ok(report) => info!(
                event = "relay.finish",
                identity = %request.identity,
                status = "succeeded",
                bytes = report.bytes_delivered,
                truncated = report.truncated,
                fallback_used = report.fallback_used,
                duration_ms = started.elapsed().as_millis() as u64,
                "relay.finish"
            ),
            Err(e) => info!(
                event = "relay.finish",
                identity = %request.identity,
                status = session_outcome(e),
                error_code = e.code(),
                error = %e,
                duration_ms = started.elapsed().as_millis() as u64,
                "relay.finish"
            ),
        }

        guard.finish(&result);
        result
    }

    async fn relay(
        &self,
        request: &RelayRequest,
        cancel: &CancelFlag,
        status: &Arc<dyn StatusSink>,
        started: Instant,
    ) -> Result<RelayReport> {
        let link = tokio::select! {
            r = self.resolver.resolve(&request.source_url) => r?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let name = link.display_name();
        info!(
            event = "relay.resolved",
            identity = %request.identity,
            name = %name,
            size_bytes = ?link.size_bytes,
            "relay.resolved"
        );

        let limit = self.options.max_bytes;
        if self.options.oversize == OversizePolicy::Reject
            && let Some(size) = link.size_bytes
            && size > limit
        {
            return Err(Error::SizeExceeded { size, limit });
        }

        let mut adapter = self.adapter(&link, &name, cancel);
        tokio::select! {
            r = adapter.open() => r?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }
        let total = adapter.state().total_size();
        let strategy = adapter.adopted_strategy().map(|s| s.name.clone());

        if let Some(total) = total
            && total > limit
        {
            if self.options.oversize == OversizePolicy::Reject {
                adapter.close();
                return Err(Error::SizeExceeded { size: total, limit });
            }
            info!(
                event = "relay.truncating",
                total,
                limit,
                "relay.truncating"
            );
        }
        let declared_truncation = total.is_some_and(|t| t > limit);
        let caption = if declared_truncation {
            let note = truncation_note(limit, limit);
            if request.caption.is_empty() {
                note
            } else {
                format!("{}\n\n{note}", request.caption)
            }
        } else {
            request.caption.clone()
        };

        let staged = self
            .maybe_stage(&mut adapter, &link, &name, cancel, status)
            .await?;
        let was_staged = staged.is_some();
        let first = match &staged {
            Some(file) => Payload::Staged(file.source()),
            None => Payload::Stream(adapter),
        };

        let delivery = self
            .deliver(
                first,
                request,
                &link,
                &name,
                &caption,
                cancel,
                status,
                staged.as_ref(),
            )
            .await?;
        drop(staged);

        Ok(RelayReport {
            identity: request.identity.clone(),
            name,
            resolver: self.resolver.name().to_string(),
            strategy,
            requested_kind: request.kind,
            kind: delivery.sent.kind,
            fallback_used: delivery.fallback_used,
            staged: was_staged,
            bytes_delivered: delivery.sent.bytes,
            total_bytes: total,
            truncated: declared_truncation || delivery.truncated_late,
            message_id: delivery.sent.message_id,
            file_id: delivery.sent.file_id,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        })
    }

    fn adapter(&self, link: &ResolvedLink, name: &str, cancel: &CancelFlag) -> TransferAdapter {
        let request = TransferRequest::new(link.direct_url.clone(), name, self.options.max_bytes)
            .with_probe_bytes(self.options.probe_bytes)
            .with_read_timeout(self.options.read_timeout)
            .with_read_retry(self.options.read_retry);
        TransferAdapter::new(
            Arc::clone(&self.connector),
            self.policy.clone(),
            request,
            cancel.clone(),
        )
    }

    fn reporter(
        &self,
        name: &str,
        phase: Phase,
        status: &Arc<dyn StatusSink>,
        cancel: &CancelFlag,
    ) -> ProgressReporter {
        ProgressReporter::new(name, Arc::clone(status), cancel.clone())
            .with_phase(phase)
            .with_interval(self.options.progress_interval)
            .with_observer(self.observer.clone())
    }

    async fn maybe_stage(
        &self,
        adapter: &mut TransferAdapter,
        link: &ResolvedLink,
        name: &str,
        cancel: &CancelFlag,
        status: &Arc<dyn StatusSink>,
    ) -> Result<Option<StagedFile>> {
        if self.options.staging != StagingMode::File {
            return Ok(None);
        }
        let (Some(total), Some(strategy)) =
            (adapter.state().total_size(), adapter.adopted_strategy())
        else {
            debug!(event = "stage.skipped", reason = "unknown length", "stage.skipped");
            return Ok(None);
        };
        if !adapter.supports_ranges() {
            debug!(event = "stage.skipped", reason = "no range support", "stage.skipped");
            return Ok(None);
        }

        let plan = StagePlan {
            url: link.direct_url.clone(),
            name: name.to_string(),
            strategy: strategy.clone(),
            len: total.min(self.options.max_bytes),
            parts: self.options.stage_parts,
            dir: self.options.staging_dir.clone(),
            read_timeout: self.options.read_timeout,
        };
        adapter.close();

        let mut reporter = self.reporter(name, Phase::Download, status, cancel);
        let staged = stage_ranges(
            Arc::clone(&self.connector),
            plan,
            cancel.clone(),
            &mut reporter,
        )
        .await?;
        reporter.finish().await;
        Ok(Some(staged))
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &self,
        mut payload: Payload,
        request: &RelayRequest,
        link: &ResolvedLink,
        name: &str,
        caption: &str,
        cancel: &CancelFlag,
        status: &Arc<dyn StatusSink>,
        staged: Option<&StagedFile>,
    ) -> Result<Delivery> {
        let kind = request.kind;
        let first = self
            .send_once(&mut payload, request, kind, caption, name, 1, status, cancel)
            .await;
        payload.source().close();

        let (rejected, message) = match first {
            Ok(sent) => {
                return Ok(Delivery {
                    sent,
                    fallback_used: false,
                    truncated_late: payload.truncated(),
                });
            }
            Err(Error::TransportRejected { kind, message }) => (kind, message),
            Err(e) => return Err(e),
        };

        warn!(
            event = "transport.rejected",
            kind = %rejected,
            message = %message,
            "transport.rejected"
        );
        let Some(fallback) = rejected.fallback() else {
            return Err(Error::TransportRejected {
                kind: rejected,
                message,
            });
        };
        cancel.check()?;

        info!(
            event = "transport.fallback",
            from = %rejected,
            to = %fallback,
            "transport.fallback"
        );
        let mut payload = match staged {
            Some(file) => Payload::Staged(file.source()),
            None => Payload::Stream(self.adapter(link, name, cancel)),
        };
        let second = self
            .send_once(&mut payload, request, fallback, caption, name, 2, status, cancel)
            .await;
        payload.source().close();

        Ok(Delivery {
            sent: second?,
            fallback_used: true,
            truncated_late: payload.truncated(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_once(
        &self,
        payload: &mut Payload,
        request: &RelayRequest,
        kind: MediaKind,
        caption: &str,
        name: &str,
        attempt: u32,
        status: &Arc<dyn StatusSink>,
        cancel: &CancelFlag,
    ) -> Result<SentMessage> {
        let mut reporter =
            self.reporter(name, Phase::Upload, status, cancel).with_attempt(attempt);
        let sent = self
            .transport
            .send(
                &request.destination,
                payload.source(),
                kind,
                caption,
                &mut reporter,
            )
            .await?;
        reporter.finish().await;
        Ok(sent)
    }
}
