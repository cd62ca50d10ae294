use std::sync::Arc;
use std::time::Duration;

use tgrelay_core::config::{self as settings_config, Settings};
use tgrelay_core::run_log::{RunLogName, start_run_log};
use tgrelay_core::{
    HttpConnector, HttpConnectorConfig, Relay, RelayOptions, SessionRegistry, StatusSink,
    TelegramBotApi, TelegramBotApiTransport, TelegramStatusMessage, build_resolver,
};
use uuid::Uuid;

mod control_ipc;

fn build_relay(
    settings: &Settings,
    api: Arc<TelegramBotApi>,
    data_root: &std::path::Path,
) -> Result<Relay, Box<dyn std::error::Error>> {
    let connector = HttpConnector::new(HttpConnectorConfig {
        connect_timeout: Duration::from_secs(settings.transfer.connect_timeout_secs),
        response_timeout: Duration::from_secs(settings.transfer.read_timeout_secs),
        ..HttpConnectorConfig::default()
    });
    let transport = TelegramBotApiTransport::new(api)
        .with_chunk_bytes(settings.transfer.chunk_bytes as usize);

    Ok(Relay::new(
        build_resolver(&settings.resolver)?,
        Arc::new(connector),
        Arc::new(transport),
        settings.retry_policy()?,
        RelayOptions::from_settings(settings, data_root),
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_root = settings_config::default_config_dir();
    let data_root = settings_config::default_data_dir();

    let settings = settings_config::load_settings(&config_root)?;

    let run_id = format!("dmn_{}", Uuid::new_v4());
    let run_log = start_run_log(&RunLogName::daemon(run_id.clone()), &data_root)?;
    tracing::info!(
        event = "run.start",
        kind = "daemon",
        run_id = %run_id,
        config_path = %settings_config::config_path(&config_root).display(),
        log_path = %run_log.path().display(),
        "run.start"
    );

    let api = Arc::new(TelegramBotApi::new(
        settings.telegram.api_base.clone(),
        settings.bot_token()?,
    )?);
    let relay = Arc::new(build_relay(&settings, api.clone(), &data_root)?);
    let registry = SessionRegistry::new();

    let status_api = api.clone();
    let state = control_ipc::ControlState {
        relay,
        registry,
        status: Arc::new(move |chat_id: &str| {
            Arc::new(TelegramStatusMessage::new(status_api.clone(), chat_id)) as Arc<dyn StatusSink>
        }),
        default_kind: settings.telegram.default_kind,
    };

    let control_socket_path = tgrelay_core::control::control_ipc_socket_path(&data_root);
    let server = match control_ipc::spawn_control_ipc_server(control_socket_path.clone(), state) {
        Ok(h) => h,
        Err(e) => {
            eprintln!(
                "ERROR: control.ipc_bind_failed: path={} error={}",
                control_socket_path.display(),
                e
            );
            tracing::error!(
                event = "control.ipc_bind_failed",
                error = %e,
                path = %control_socket_path.display(),
                "control.ipc_bind_failed"
            );
            return Err(e.into());
        }
    };
    tracing::info!(
        event = "control.ipc_listening",
        path = %control_socket_path.display(),
        "control.ipc_listening"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!(event = "run.finish", kind = "daemon", run_id = %run_id, "run.finish");
    server.shutdown().await;
    Ok(())
}
