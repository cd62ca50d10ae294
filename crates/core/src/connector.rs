use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, HeaderName, HeaderValue, RANGE};

use crate::retry::{IpFamily, Strategy};
use crate::{Error, Result};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Inclusive byte range requested from the server. `end = None` means "to the end".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn from_offset(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn span(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end.is_none()
    }

    pub fn header_value(&self) -> Option<String> {
        if self.is_full() {
            return None;
        }
        Some(match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        })
    }
}

/// An established HTTP exchange whose body has not been consumed yet.
///
/// Dropping the connection releases it.
pub trait Connection: Send {
    fn status(&self) -> u16;

    fn content_length(&self) -> Option<u64>;

    fn accepts_ranges(&self) -> bool;

    /// Next body chunk; `None` at end of body.
    fn next_chunk<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bytes>>> + Send + 'a>>;
}

pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        strategy: &'a Strategy,
        range: ByteRange,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Connection>>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct HttpConnectorConfig {
    pub connect_timeout: Duration,
    /// Time allowed for response headers to arrive.
    pub response_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(60),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// reqwest-backed connector. Keeps one client per strategy so proxy and address-family
/// settings stay isolated.
pub struct HttpConnector {
    config: HttpConnectorConfig,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl HttpConnector {
    pub fn new(config: HttpConnectorConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, strategy: &Strategy) -> Result<reqwest::Client> {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(client) = clients.get(&strategy.name) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .user_agent(self.config.user_agent.clone());

        if let Some(proxy) = &strategy.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| Error::InvalidConfig {
                message: format!("invalid proxy for strategy {}: {e}", strategy.name),
            })?;
            builder = builder.proxy(proxy);
        }

        builder = match strategy.ip_family {
            IpFamily::Any => builder,
            IpFamily::V4 => builder.local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            IpFamily::V6 => builder.local_address(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        };

        let client = builder.build().map_err(|e| Error::Connection {
            message: format!("http client build failed: {e}"),
        })?;
        clients.insert(strategy.name.clone(), client.clone());
        Ok(client)
    }
}

impl Connector for HttpConnector {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        strategy: &'a Strategy,
        range: ByteRange,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Connection>>> + Send + 'a>> {
        Box::pin(async move {
            let client = self.client_for(strategy)?;

            let mut req = client.get(url);
            for (name, value) in &strategy.headers {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    Error::InvalidConfig {
                        message: format!("invalid header name {name:?}: {e}"),
                    }
                })?;
                let value = HeaderValue::from_str(value).map_err(|e| Error::InvalidConfig {
                    message: format!("invalid header value for {name}: {e}"),
                })?;
                req = req.header(name, value);
            }
            if let Some(v) = range.header_value() {
                req = req.header(RANGE, v);
            }

            let response = tokio::time::timeout(self.config.response_timeout, req.send())
                .await
                .map_err(|_| Error::Connection {
                    message: format!(
                        "no response within {}s",
                        self.config.response_timeout.as_secs()
                    ),
                })?
                .map_err(|e| Error::Connection {
                    message: format!("request failed: {e}"),
                })?;

            // The body size hint shrinks as chunks are read, so the length is taken now.
            let content_length = response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .or_else(|| response.content_length());

            Ok(Box::new(HttpConnection {
                response,
                content_length,
            }) as Box<dyn Connection>)
        })
    }
}

struct HttpConnection {
    response: reqwest::Response,
    content_length: Option<u64>,
}

impl Connection for HttpConnection {
    fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn accepts_ranges(&self) -> bool {
        if self.response.status() == reqwest::StatusCode::PARTIAL_CONTENT {
            return true;
        }
        self.response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"))
    }

    fn next_chunk<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bytes>>> + Send + 'a>> {
        Box::pin(async move {
            self.response.chunk().await.map_err(|e| Error::Connection {
                message: format!("read failed: {e}"),
            })
        })
    }
}
