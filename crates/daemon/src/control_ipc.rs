use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, oneshot};

use tgrelay_core::control::{
    ControlError, ControlRequest, ControlResponse, METHOD_TRANSFER_CANCEL, METHOD_TRANSFER_START,
    METHOD_TRANSFER_STATUS, TransferCancelResult, TransferIdentityParams, TransferStartParams,
    TransferStateResult,
};
use tgrelay_core::{MediaKind, Relay, RelayRequest, SessionRegistry, StatusSink};

/// Builds the status sink for a transfer headed to `chat_id`.
pub type StatusFactory = Arc<dyn Fn(&str) -> Arc<dyn StatusSink> + Send + Sync>;

/// What the control socket needs to start and steer transfers.
#[derive(Clone)]
pub struct ControlState {
    pub relay: Arc<Relay>,
    pub registry: Arc<SessionRegistry>,
    pub status: StatusFactory,
    pub default_kind: MediaKind,
}

pub struct ControlIpcServerHandle {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ControlIpcServerHandle {
    pub async fn shutdown(self) {
        let mut this = self;
        if let Some(tx) = this.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = this.task.take() {
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&this.socket_path);
    }
}

impl Drop for ControlIpcServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

pub fn spawn_control_ipc_server(
    socket_path: PathBuf,
    state: ControlState,
) -> std::io::Result<ControlIpcServerHandle> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
            {
                tracing::error!(
                    event = "control.ipc_permissions_failed",
                    error = %e,
                    path = %parent.display(),
                    "control.ipc_permissions_failed"
                );
                return Err(e);
            }
        }
    }

    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(&socket_path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
        {
            tracing::error!(
                event = "control.ipc_permissions_failed",
                error = %e,
                path = %socket_path.display(),
                "control.ipc_permissions_failed"
            );
            drop(listener);
            let _ = std::fs::remove_file(&socket_path);
            return Err(e);
        }
    }

    let handle_socket_path = socket_path.clone();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let (shutdown_broadcast, _) = broadcast::channel::<()>(8);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = shutdown_broadcast.send(());
                    break;
                }
                accept = listener.accept() => {
                    let (stream, _) = match accept {
                        Ok(x) => x,
                        Err(e) => {
                            tracing::warn!(
                                event = "control.ipc_accept_failed",
                                error = %e,
                                path = %socket_path.display(),
                                "control.ipc_accept_failed"
                            );
                            continue;
                        }
                    };

                    let mut shutdown = shutdown_broadcast.subscribe();
                    let state = state.clone();
                    tokio::spawn(async move {
                        let _ = handle_control_ipc_client(stream, &state, &mut shutdown).await;
                    });
                }
            }
        }
    });

    Ok(ControlIpcServerHandle {
        socket_path: handle_socket_path,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn handle_control_ipc_client(
    stream: UnixStream,
    state: &ControlState,
    shutdown: &mut broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let (r, w) = stream.into_split();
    let mut r = BufReader::new(r);
    let mut w = BufWriter::new(w);

    const MAX_REQUEST_LINE_BYTES: usize = 64 * 1024;

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if buf.len() > MAX_REQUEST_LINE_BYTES {
            break;
        }

        tokio::select! {
            res = r.read(&mut chunk) => {
                let n = res?;
                if n == 0 {
                    break;
                }

                if let Some(pos) = chunk[..n].iter().position(|b| *b == b'\n') {
                    buf.extend_from_slice(&chunk[..pos]);
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            _ = shutdown.recv() => return Ok(()),
        }
    }

    if buf.is_empty() {
        return Ok(());
    }

    if buf.len() > MAX_REQUEST_LINE_BYTES {
        write_json_line(
            &mut w,
            &ControlResponse::err(
                "unknown",
                ControlError::invalid_request("request too large", serde_json::json!({})),
            ),
        )
        .await?;
        return Ok(());
    }

    let Ok(line) = String::from_utf8(buf) else {
        write_json_line(
            &mut w,
            &ControlResponse::err(
                "unknown",
                ControlError::invalid_request("invalid utf-8", serde_json::json!({})),
            ),
        )
        .await?;
        return Ok(());
    };

    let req: ControlRequest = match serde_json::from_str(line.trim_end()) {
        Ok(x) => x,
        Err(e) => {
            write_json_line(
                &mut w,
                &ControlResponse::err(
                    "unknown",
                    ControlError::invalid_request(
                        "invalid json",
                        serde_json::json!({ "error": e.to_string() }),
                    ),
                ),
            )
            .await?;
            return Ok(());
        }
    };

    let resp = handle_request(&req, state);
    write_json_line(&mut w, &resp).await?;
    Ok(())
}

fn parse_params<T: serde::de::DeserializeOwned>(
    req: &ControlRequest,
) -> Result<T, ControlResponse> {
    serde_json::from_value(req.params.clone()).map_err(|e| {
        ControlResponse::err(
            req.id.clone(),
            ControlError::invalid_request(
                "invalid params",
                serde_json::json!({ "error": e.to_string() }),
            ),
        )
    })
}

fn to_response<T: serde::Serialize>(id: &str, v: &T) -> ControlResponse {
    ControlResponse::ok(
        id.to_string(),
        serde_json::to_value(v).unwrap_or(serde_json::json!({})),
    )
}

fn handle_request(req: &ControlRequest, state: &ControlState) -> ControlResponse {
    if req.type_ != "control.request" || req.id.trim().is_empty() || req.method.trim().is_empty() {
        return ControlResponse::err(
            req.id.clone(),
            ControlError::invalid_request(
                "invalid request envelope",
                serde_json::json!({
                    "type": req.type_,
                    "method": req.method,
                }),
            ),
        );
    }

    match req.method.as_str() {
        METHOD_TRANSFER_START => {
            let params: TransferStartParams = match parse_params(req) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            match transfer_start(state, params) {
                Ok(v) => to_response(&req.id, &v),
                Err(e) => ControlResponse::err(req.id.clone(), e),
            }
        }
        METHOD_TRANSFER_CANCEL => {
            let params: TransferIdentityParams = match parse_params(req) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            let cancelled = state.registry.cancel(&params.identity);
            to_response(
                &req.id,
                &TransferCancelResult {
                    identity: params.identity,
                    cancelled,
                },
            )
        }
        METHOD_TRANSFER_STATUS => {
            let params: TransferIdentityParams = match parse_params(req) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            let status = state.registry.status(&params.identity);
            to_response(
                &req.id,
                &TransferStateResult {
                    identity: params.identity,
                    state: status.state,
                    last_outcome: status.last_outcome,
                },
            )
        }
        _ => ControlResponse::err(
            req.id.clone(),
            ControlError::method_not_found(
                "method not found",
                serde_json::json!({ "method": req.method }),
            ),
        ),
    }
}

/// Marks the identity active and runs the relay in the background. A busy identity is refused
/// here, before anything is spawned.
fn transfer_start(
    state: &ControlState,
    params: TransferStartParams,
) -> Result<TransferStateResult, ControlError> {
    for (field, value) in [
        ("identity", &params.identity),
        ("url", &params.url),
        ("chatId", &params.chat_id),
    ] {
        if value.trim().is_empty() {
            return Err(ControlError::invalid_request(
                format!("{field} is empty"),
                serde_json::json!({ "field": field }),
            ));
        }
    }

    let guard = state
        .registry
        .begin(&params.identity)
        .map_err(|e| ControlError::from_core(&e))?;

    let request = RelayRequest {
        identity: params.identity.clone(),
        source_url: params.url.trim().to_string(),
        destination: params.chat_id.trim().to_string(),
        kind: params.kind.unwrap_or(state.default_kind),
        caption: params.caption.unwrap_or_default(),
    };
    let status = (state.status)(&request.destination);
    let relay = Arc::clone(&state.relay);
    tokio::spawn(async move {
        let identity = request.identity.clone();
        if let Err(e) = relay.run_with_guard(guard, request, status).await {
            tracing::debug!(
                event = "control.transfer_ended",
                identity = %identity,
                error_code = e.code(),
                "control.transfer_ended"
            );
        }
    });

    let status = state.registry.status(&params.identity);
    Ok(TransferStateResult {
        identity: params.identity,
        state: status.state,
        last_outcome: status.last_outcome,
    })
}

async fn write_json_line(
    w: &mut BufWriter<tokio::net::unix::OwnedWriteHalf>,
    v: &ControlResponse,
) -> std::io::Result<()> {
    let line = serde_json::to_string(v).map_err(|e| std::io::Error::other(e.to_string()))?;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await?;
    Ok(())
}
