use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tgrelay_core::config::{self as settings_config, Settings};
use tgrelay_core::control::{
    ControlError, ControlRequest, ControlResponse, METHOD_TRANSFER_CANCEL, METHOD_TRANSFER_START,
    METHOD_TRANSFER_STATUS, control_ipc_socket_path,
};
use tgrelay_core::run_log::{RunLogName, start_run_log};
use tgrelay_core::{
    CancelFlag, ChatTransport, HttpConnector, HttpConnectorConfig, InMemoryTransport,
    LinkResolver, LogStatusSink, MediaKind, ProgressSink, ProgressSnapshot, PullSource, Relay,
    RelayOptions, RelayRequest, SessionRegistry, StatusSink, TelegramBotApi,
    TelegramBotApiTransport, TelegramStatusMessage, TransferAdapter, TransferRequest,
    build_resolver,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "tgrelay")]
#[command(about = "Relay remote files into Telegram chats", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve, download and upload one link.
    Relay {
        #[arg(long)]
        url: String,
        #[arg(long, allow_hyphen_values = true)]
        chat_id: Option<String>,
        #[arg(long)]
        kind: Option<MediaKind>,
        #[arg(long, default_value = "")]
        caption: String,
        #[arg(long, default_value = "cli")]
        identity: String,
        /// Fetch everything but keep the upload in memory.
        #[arg(long)]
        dry_run: bool,
        /// Do not post a progress message to the chat.
        #[arg(long)]
        no_status: bool,
    },
    /// Print the direct link a source URL resolves to.
    Resolve { url: String },
    /// Try the configured strategies against a direct URL and report the one adopted.
    Probe { url: String },
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    Telegram {
        #[command(subcommand)]
        cmd: TelegramCmd,
    },
    /// Talk to a running tgrelayd.
    Daemon {
        #[command(subcommand)]
        cmd: DaemonCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Set,
}

#[derive(Subcommand)]
enum TelegramCmd {
    Validate,
}

#[derive(Subcommand)]
enum DaemonCmd {
    Start {
        #[arg(long)]
        url: String,
        #[arg(long, allow_hyphen_values = true)]
        chat_id: String,
        #[arg(long)]
        kind: Option<MediaKind>,
        #[arg(long)]
        caption: Option<String>,
        #[arg(long, default_value = "cli")]
        identity: String,
    },
    Cancel {
        #[arg(long, default_value = "cli")]
        identity: String,
    },
    Status {
        #[arg(long, default_value = "cli")]
        identity: String,
    },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }
}

struct NdjsonProgressSink {
    task_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: ProgressSnapshot) {
        let line = serde_json::json!({
            "type": "task.progress",
            "taskId": self.task_id,
            "phase": p.phase,
            "attempt": p.attempt,
            "name": p.name,
            "bytesTransferred": p.bytes_transferred,
            "totalBytes": p.total_bytes,
            "percent": p.percent,
            "bytesPerSecond": p.bytes_per_second,
            "etaSeconds": p.eta_seconds,
        });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .unwrap_or_else(settings_config::default_config_dir);
    let data_dir = cli.data_dir.unwrap_or_else(settings_config::default_data_dir);

    match cli.cmd {
        Command::Relay {
            url,
            chat_id,
            kind,
            caption,
            identity,
            dry_run,
            no_status,
        } => {
            relay_run(
                &config_dir,
                &data_dir,
                RelayArgs {
                    url,
                    chat_id,
                    kind,
                    caption,
                    identity,
                    dry_run,
                    no_status,
                },
                cli.json,
                cli.events,
            )
            .await
        }
        Command::Resolve { url } => resolve(&config_dir, &url, cli.json).await,
        Command::Probe { url } => probe(&config_dir, &url, cli.json).await,
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
            SettingsCmd::Set => settings_set(&config_dir, cli.json),
        },
        Command::Telegram { cmd } => match cmd {
            TelegramCmd::Validate => telegram_validate(&config_dir, cli.json).await,
        },
        Command::Daemon { cmd } => {
            let (method, params) = match cmd {
                DaemonCmd::Start {
                    url,
                    chat_id,
                    kind,
                    caption,
                    identity,
                } => (
                    METHOD_TRANSFER_START,
                    serde_json::json!({
                        "identity": identity,
                        "url": url,
                        "chatId": chat_id,
                        "kind": kind,
                        "caption": caption,
                    }),
                ),
                DaemonCmd::Cancel { identity } => (
                    METHOD_TRANSFER_CANCEL,
                    serde_json::json!({ "identity": identity }),
                ),
                DaemonCmd::Status { identity } => (
                    METHOD_TRANSFER_STATUS,
                    serde_json::json!({ "identity": identity }),
                ),
            };
            let result = control_call(&data_dir, method, params).await?;
            print_value(&result, cli.json);
            Ok(())
        }
    }
}

struct RelayArgs {
    url: String,
    chat_id: Option<String>,
    kind: Option<MediaKind>,
    caption: String,
    identity: String,
    dry_run: bool,
    no_status: bool,
}

async fn relay_run(
    config_dir: &Path,
    data_dir: &Path,
    args: RelayArgs,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let settings = settings_config::load_settings(config_dir).map_err(map_core_err)?;

    let destination = match (&args.chat_id, args.dry_run) {
        (Some(id), _) => id.trim().to_string(),
        (None, true) => "dry-run".to_string(),
        (None, false) => return Err(CliError::new("config.invalid", "--chat-id is required")),
    };

    let task_id = format!("tsk_{}", uuid::Uuid::new_v4());
    let run_log = start_run_log(
        &RunLogName::relay(task_id.clone(), &args.identity, &args.url),
        data_dir,
    )
    .map_err(|e| CliError::new("log.init_failed", e.to_string()))?;
    tracing::info!(
        event = "run.start",
        kind = "relay",
        run_id = %task_id,
        dry_run = args.dry_run,
        log_path = %run_log.path().display(),
        "run.start"
    );

    let (transport, status): (Arc<dyn ChatTransport>, Arc<dyn StatusSink>) = if args.dry_run {
        (
            Arc::new(InMemoryTransport::discarding()),
            Arc::new(LogStatusSink),
        )
    } else {
        let api = Arc::new(
            TelegramBotApi::new(
                settings.telegram.api_base.clone(),
                settings.bot_token().map_err(map_core_err)?,
            )
            .map_err(map_core_err)?,
        );
        let status: Arc<dyn StatusSink> = if args.no_status {
            Arc::new(LogStatusSink)
        } else {
            Arc::new(TelegramStatusMessage::new(api.clone(), destination.clone()))
        };
        let transport = TelegramBotApiTransport::new(api)
            .with_chunk_bytes(settings.transfer.chunk_bytes as usize);
        (Arc::new(transport), status)
    };

    let mut relay = Relay::new(
        build_resolver(&settings.resolver).map_err(map_core_err)?,
        Arc::new(http_connector(&settings)),
        transport,
        settings.retry_policy().map_err(map_core_err)?,
        RelayOptions::from_settings(&settings, data_dir),
    );
    if events {
        relay = relay.with_observer(Arc::new(NdjsonProgressSink {
            task_id: task_id.clone(),
        }));
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "taskId": task_id,
                "kind": "relay",
                "state": "running"
            })
        );
    }

    let registry = SessionRegistry::new();
    let ctrl_c = {
        let registry = registry.clone();
        let identity = args.identity.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                registry.cancel(&identity);
            }
        })
    };

    let request = RelayRequest {
        identity: args.identity,
        source_url: args.url,
        destination,
        kind: args.kind.unwrap_or(settings.telegram.default_kind),
        caption: args.caption,
    };
    let res = relay.run(&registry, request, status).await;
    ctrl_c.abort();
    tracing::info!(
        event = "run.finish",
        kind = "relay",
        run_id = %task_id,
        ok = res.is_ok(),
        "run.finish"
    );

    let report = match res {
        Ok(report) => report,
        Err(e) => {
            if events {
                let state = match e {
                    tgrelay_core::Error::Cancelled => "cancelled",
                    _ => "failed",
                };
                println!(
                    "{}",
                    serde_json::json!({
                        "type": "task.state",
                        "taskId": task_id,
                        "kind": "relay",
                        "state": state,
                        "error": { "code": e.code(), "message": e.to_string() },
                    })
                );
            }
            return Err(map_core_err(e));
        }
    };

    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "taskId": task_id,
                "kind": "relay",
                "state": "succeeded",
                "report": report,
            })
        );
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::to_string(&report)
                .map_err(|e| CliError::new("config.invalid", e.to_string()))?
        );
    } else {
        println!(
            "name={} kind={} bytes={} truncated={} fallbackUsed={} staged={}",
            report.name,
            report.kind,
            report.bytes_delivered,
            report.truncated,
            report.fallback_used,
            report.staged
        );
        println!("messageId={}", report.message_id);
    }
    Ok(())
}

fn http_connector(settings: &Settings) -> HttpConnector {
    HttpConnector::new(HttpConnectorConfig {
        connect_timeout: Duration::from_secs(settings.transfer.connect_timeout_secs),
        response_timeout: Duration::from_secs(settings.transfer.read_timeout_secs),
        ..HttpConnectorConfig::default()
    })
}

async fn resolve(config_dir: &Path, url: &str, json: bool) -> Result<(), CliError> {
    let settings = settings_config::load_settings(config_dir).map_err(map_core_err)?;
    let resolver = build_resolver(&settings.resolver).map_err(map_core_err)?;
    let link = resolver.resolve(url).await.map_err(map_core_err)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "resolver": resolver.name(),
                "link": link,
                "name": link.display_name(),
            })
        );
    } else {
        println!("directUrl={}", link.direct_url);
        println!("name={}", link.display_name());
        if let Some(size) = link.size_bytes {
            println!("sizeBytes={size}");
        }
    }
    Ok(())
}

async fn probe(config_dir: &Path, url: &str, json: bool) -> Result<(), CliError> {
    let settings = settings_config::load_settings(config_dir).map_err(map_core_err)?;
    let request = TransferRequest::new(url, "probe", settings.transfer.max_bytes)
        .with_probe_bytes(settings.transfer.probe_bytes as usize)
        .with_read_timeout(Duration::from_secs(settings.transfer.read_timeout_secs))
        .with_read_retry(settings.read_retry());
    let mut adapter = TransferAdapter::new(
        Arc::new(http_connector(&settings)),
        settings.retry_policy().map_err(map_core_err)?,
        request,
        CancelFlag::new(),
    );

    let opened = adapter.open().await;
    let strategy = adapter.adopted_strategy().map(|s| s.name.clone());
    let total = adapter.state().total_size();
    let ranges = adapter.supports_ranges();
    adapter.close();
    opened.map_err(map_core_err)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "strategy": strategy,
                "totalBytes": total,
                "acceptsRanges": ranges,
                "exceedsLimit": total.is_some_and(|t| t > settings.transfer.max_bytes),
            })
        );
    } else {
        println!("strategy={}", strategy.unwrap_or_default());
        match total {
            Some(t) => println!("totalBytes={t}"),
            None => println!("totalBytes=unknown"),
        }
        println!("acceptsRanges={ranges}");
    }
    Ok(())
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = settings_config::load_settings(config_dir).map_err(map_core_err)?;
    let token_present = settings.bot_token().is_ok();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "settings": settings,
                "secrets": { "telegramBotTokenPresent": token_present }
            })
        );
    } else {
        let text = settings_config::to_toml(&settings).map_err(map_core_err)?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
        println!();
        println!("telegramBotTokenPresent={token_present}");
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings = settings_config::parse_settings(&input)
        .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    settings_config::validate_settings(&settings).map_err(map_core_err)?;
    settings_config::save_settings(config_dir, &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

async fn telegram_validate(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = settings_config::load_settings(config_dir).map_err(map_core_err)?;
    let token = settings
        .bot_token()
        .map_err(|e| CliError::new("telegram.unauthorized", e.to_string()))?;
    let api = TelegramBotApi::new(settings.telegram.api_base.clone(), token)
        .map_err(map_core_err)?;
    let bot_username = api.get_me().await.map_err(map_core_err)?.unwrap_or_default();

    if json {
        println!("{}", serde_json::json!({ "botUsername": bot_username }));
    } else {
        println!("botUsername={bot_username}");
    }
    Ok(())
}

async fn control_call(
    data_dir: &Path,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, CliError> {
    let socket_path = control_ipc_socket_path(data_dir);
    let req = ControlRequest::new(format!("req_{}", uuid::Uuid::new_v4()), method, params);

    let exchange = async {
        let stream = tokio::net::UnixStream::connect(&socket_path)
            .await
            .map_err(|e| {
                control_err(ControlError::unavailable(
                    format!("daemon not reachable: {e}"),
                    serde_json::json!({ "path": socket_path.display().to_string() }),
                ))
            })?;
        let (r, mut w) = stream.into_split();
        let line = serde_json::to_string(&req)
            .map_err(|e| CliError::new("control.invalid_request", e.to_string()))?
            + "\n";
        w.write_all(line.as_bytes())
            .await
            .map_err(|e| CliError::retryable("control.unavailable", e.to_string()))?;
        w.flush()
            .await
            .map_err(|e| CliError::retryable("control.unavailable", e.to_string()))?;

        let mut lines = tokio::io::BufReader::new(r).lines();
        let resp_line = lines
            .next_line()
            .await
            .map_err(|e| CliError::retryable("control.unavailable", e.to_string()))?
            .ok_or_else(|| CliError::retryable("control.unavailable", "daemon closed the socket"))?;
        serde_json::from_str::<ControlResponse>(&resp_line)
            .map_err(|e| CliError::new("control.invalid_response", e.to_string()))
    };

    let resp = tokio::time::timeout(CONTROL_TIMEOUT, exchange)
        .await
        .map_err(|_| {
            control_err(ControlError::timeout(
                "daemon did not answer",
                serde_json::json!({ "method": method }),
            ))
        })??;

    match (resp.ok, resp.result, resp.error) {
        (true, Some(result), _) => Ok(result),
        (true, None, _) => Ok(serde_json::json!({})),
        (false, _, Some(e)) => Err(control_err(e)),
        (false, _, None) => Err(CliError::new(
            "control.invalid_response",
            "error response without error",
        )),
    }
}

/// Remote error codes are dynamic; they travel in `details`.
fn control_err(e: ControlError) -> CliError {
    CliError {
        code: "control.failed",
        message: e.message.clone(),
        retryable: e.retryable,
        details: serde_json::to_value(&e).unwrap_or(serde_json::json!({})),
    }
}

fn print_value(v: &serde_json::Value, json: bool) {
    if json {
        println!("{v}");
        return;
    }
    match v.as_object() {
        Some(map) => {
            for (k, v) in map {
                match v {
                    serde_json::Value::String(s) => println!("{k}={s}"),
                    other => println!("{k}={other}"),
                }
            }
        }
        None => println!("{v}"),
    }
}

fn map_core_err(e: tgrelay_core::Error) -> CliError {
    CliError {
        code: e.code(),
        message: e.to_string(),
        details: serde_json::json!({ "userMessage": e.user_message() }),
        retryable: e.retryable(),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
