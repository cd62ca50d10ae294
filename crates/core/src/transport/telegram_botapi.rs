use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::{BodyItem, ChatTransport, DEFAULT_CHUNK_BYTES, MediaKind, SentMessage, pump};
use crate::progress::{ProgressCallback, StatusSink};
use crate::source::PullSource;
use crate::{Error, Result};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Minimal Bot API client: builds method URLs and decodes the `{ok, result, description}`
/// envelope.
#[derive(Debug, Clone)]
pub struct TelegramBotApi {
    api_base: String,
    bot_token: String,
    client: reqwest::Client,
}

#[derive(Debug)]
struct ApiFailure {
    status: Option<u16>,
    description: String,
}

impl TelegramBotApi {
    pub fn new(api_base: impl Into<String>, bot_token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Telegram {
                message: format!("http client build failed: {e}"),
            })?;
        Ok(Self {
            api_base: api_base.into(),
            bot_token: bot_token.into(),
            client,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.bot_token,
            method
        )
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &serde_json::Value,
    ) -> std::result::Result<T, ApiFailure> {
        let res = self
            .client
            .post(self.method_url(method))
            .json(params)
            .send()
            .await
            .map_err(|e| ApiFailure {
                status: None,
                description: format!("request failed: {}", e.without_url()),
            })?;
        decode(res).await
    }

    async fn call_multipart<T: DeserializeOwned>(
        &self,
        method: &str,
        form: reqwest::multipart::Form,
    ) -> std::result::Result<T, ApiFailure> {
        let res = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ApiFailure {
                status: None,
                description: format!("request failed: {}", e.without_url()),
            })?;
        decode(res).await
    }

    /// `getMe`: proves the token works and returns the bot's username.
    pub async fn get_me(&self) -> Result<Option<String>> {
        let me: TelegramUser = self
            .call("getMe", &serde_json::json!({}))
            .await
            .map_err(|f| Error::Telegram {
                message: format!("getMe failed: {}", f.description),
            })?;
        Ok(me.username)
    }
}

async fn decode<T: DeserializeOwned>(res: reqwest::Response) -> std::result::Result<T, ApiFailure> {
    let status = res.status();
    let body = res.text().await.map_err(|e| ApiFailure {
        status: Some(status.as_u16()),
        description: format!("read response failed: {}", e.without_url()),
    })?;

    let parsed: TelegramResponse<T> = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return Err(ApiFailure {
                status: Some(status.as_u16()),
                description: if status.is_success() {
                    format!("invalid json: {e}; body={body}")
                } else {
                    format!("http {status}: {body}")
                },
            });
        }
    };

    if !parsed.ok {
        return Err(ApiFailure {
            status: parsed
                .error_code
                .and_then(|c| u16::try_from(c).ok())
                .or(Some(status.as_u16())),
            description: parsed
                .description
                .unwrap_or_else(|| "telegram returned ok=false".to_string()),
        });
    }

    parsed.result.ok_or_else(|| ApiFailure {
        status: Some(status.as_u16()),
        description: "missing result".to_string(),
    })
}

/// Uploads through `sendVideo` / `sendDocument`, streaming the multipart body straight from
/// the source.
pub struct TelegramBotApiTransport {
    api: Arc<TelegramBotApi>,
    chunk_bytes: usize,
}

impl TelegramBotApiTransport {
    pub fn new(api: Arc<TelegramBotApi>) -> Self {
        Self {
            api,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }

    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }
}

/// Bot API descriptions that refuse the media itself rather than the request. Anything else
/// (unknown chat, caption too long, missing rights) fails the same way for every kind.
const MEDIA_REFUSALS: &[&str] = &[
    "wrong file",
    "wrong type",
    "file type",
    "content_type",
    "content type",
    "video",
    "media",
    "dimensions",
    "duration",
    "codec",
    "file must be non-empty",
];

fn is_media_refusal(description: &str) -> bool {
    let description = description.to_ascii_lowercase();
    MEDIA_REFUSALS.iter().any(|needle| description.contains(needle))
}

fn send_error(kind: MediaKind, failure: ApiFailure) -> Error {
    if failure.status == Some(400)
        && kind.fallback().is_some()
        && is_media_refusal(&failure.description)
    {
        return Error::TransportRejected {
            kind,
            message: failure.description,
        };
    }
    Error::Telegram {
        message: format!("{} failed: {}", kind.method(), failure.description),
    }
}

impl ChatTransport for TelegramBotApiTransport {
    fn provider(&self) -> &'static str {
        "telegram.botapi"
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
            let length = source.length().declared();

            let (tx, rx) = mpsc::channel::<BodyItem>(4);
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            let body = reqwest::Body::wrap_stream(stream);
            let part = match length {
                Some(len) => reqwest::multipart::Part::stream_with_length(body, len),
                None => reqwest::multipart::Part::stream(body),
            }
            .file_name(name.clone());

            let mut form = reqwest::multipart::Form::new()
                .text("chat_id", destination.to_string())
                .part(kind.as_str(), part);
            if !caption.is_empty() {
                form = form.text("caption", caption.to_string());
            }
            if kind == MediaKind::Video {
                form = form.text("supports_streaming", "true");
            }

            debug!(
                event = "transport.send",
                method = kind.method(),
                name = %name,
                length = ?length,
                "transport.send"
            );

            let request = self
                .api
                .call_multipart::<TelegramMessage>(kind.method(), form);
            let (pumped, response) =
                tokio::join!(pump(source, self.chunk_bytes, progress, tx), request);
            let bytes = pumped?;
            let message = response.map_err(|f| send_error(kind, f))?;

            let file_id = message
                .video
                .or(message.document)
                .map(|f| f.file_id);
            Ok(SentMessage {
                message_id: message.message_id,
                kind,
                file_id,
                bytes,
            })
        })
    }
}

/// One status message per transfer: sent on first update, edited afterwards, deleted on clear.
pub struct TelegramStatusMessage {
    api: Arc<TelegramBotApi>,
    chat_id: String,
    message_id: Mutex<Option<i64>>,
}

impl TelegramStatusMessage {
    pub fn new(api: Arc<TelegramBotApi>, chat_id: impl Into<String>) -> Self {
        Self {
            api,
            chat_id: chat_id.into(),
            message_id: Mutex::new(None),
        }
    }

    pub async fn message_id(&self) -> Option<i64> {
        *self.message_id.lock().await
    }
}

impl StatusSink for TelegramStatusMessage {
    fn show<'a>(&'a self, text: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut message_id = self.message_id.lock().await;
            match *message_id {
                Some(id) => {
                    let params = serde_json::json!({
                        "chat_id": self.chat_id,
                        "message_id": id,
                        "text": text,
                    });
                    match self
                        .api
                        .call::<serde_json::Value>("editMessageText", &params)
                        .await
                    {
                        Ok(_) => Ok(()),
                        Err(f) if f.description.contains("message is not modified") => Ok(()),
                        Err(f) => Err(Error::Telegram {
                            message: format!("editMessageText failed: {}", f.description),
                        }),
                    }
                }
                None => {
                    let params = serde_json::json!({
                        "chat_id": self.chat_id,
                        "text": text,
                    });
                    let sent: TelegramMessage = self
                        .api
                        .call("sendMessage", &params)
                        .await
                        .map_err(|f| Error::Telegram {
                            message: format!("sendMessage failed: {}", f.description),
                        })?;
                    *message_id = Some(sent.message_id);
                    Ok(())
                }
            }
        })
    }

    fn clear<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let Some(id) = self.message_id.lock().await.take() else {
                return Ok(());
            };
            let params = serde_json::json!({
                "chat_id": self.chat_id,
                "message_id": id,
            });
            self.api
                .call::<bool>("deleteMessage", &params)
                .await
                .map_err(|f| Error::Telegram {
                    message: format!("deleteMessage failed: {}", f.description),
                })?;
            Ok(())
        })
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    video: Option<TelegramFile>,
    document: Option<TelegramFile>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    file_id: String,
}
