#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tgrelay_core::progress::{ProgressSink, ProgressSnapshot};
use tgrelay_core::resolver::{LinkResolver, ResolvedLink};
use tgrelay_core::retry::Strategy;
use tgrelay_core::{ByteRange, Connection, Connector, Error, Result, StatusSink};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Byte served at absolute offset `pos` by a counting body.
pub fn pattern_byte(pos: u64) -> u8 {
    (pos % 251) as u8
}

pub fn pattern(start: u64, len: usize) -> Vec<u8> {
    (0..len as u64).map(|i| pattern_byte(start + i)).collect()
}

/// A synthetic response body.
#[derive(Debug, Clone)]
pub struct Body {
    pub len: u64,
    pub chunk: usize,
    pub declare_length: bool,
    pub accept_ranges: bool,
    pub zeros: bool,
    /// Reads at or past this offset stall `stalls` times before data flows again.
    pub stall_at: Option<u64>,
    pub stalls: usize,
    /// Every chunk after the first stalls this many times before it arrives.
    pub stalls_per_chunk: usize,
}

impl Body {
    pub fn new(len: u64) -> Self {
        Self {
            len,
            chunk: 4096,
            declare_length: true,
            accept_ranges: false,
            zeros: false,
            stall_at: None,
            stalls: 0,
            stalls_per_chunk: 0,
        }
    }

    pub fn chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn undeclared(mut self) -> Self {
        self.declare_length = false;
        self
    }

    pub fn ranged(mut self) -> Self {
        self.accept_ranges = true;
        self
    }

    /// Serves zeros from one shared buffer instead of a counting pattern.
    pub fn zeros(mut self) -> Self {
        self.zeros = true;
        self
    }

    pub fn stall_at(mut self, offset: u64, stalls: usize) -> Self {
        self.stall_at = Some(offset);
        self.stalls = stalls;
        self
    }

    pub fn stall_each_chunk(mut self, stalls: usize) -> Self {
        self.stalls_per_chunk = stalls;
        self
    }
}

#[derive(Debug, Clone)]
pub enum Script {
    /// `connect` itself fails.
    Refuse,
    /// Headers arrive with this status and an empty body.
    Status(u16),
    Serve(Body),
}

struct FakeConnection {
    status: u16,
    content_length: Option<u64>,
    accept_ranges: bool,
    pos: u64,
    end: u64,
    chunk: usize,
    zeros: Option<Bytes>,
    stall_at: Option<u64>,
    stalls_left: usize,
    stalls_per_chunk: usize,
    chunk_stalls_left: usize,
    live: Arc<AtomicUsize>,
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Connection for FakeConnection {
    fn status(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn accepts_ranges(&self) -> bool {
        self.accept_ranges
    }

    fn next_chunk<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bytes>>> + Send + 'a>> {
        Box::pin(async move {
            if self.stall_at.is_some_and(|at| self.pos >= at) && self.stalls_left > 0 {
                self.stalls_left -= 1;
                return std::future::pending::<Result<Option<Bytes>>>().await;
            }
            if self.chunk_stalls_left > 0 {
                self.chunk_stalls_left -= 1;
                return std::future::pending::<Result<Option<Bytes>>>().await;
            }
            if self.pos >= self.end {
                return Ok(None);
            }
            let n = (self.end - self.pos).min(self.chunk as u64) as usize;
            let data = match &self.zeros {
                Some(zeros) => zeros.slice(0..n),
                None => Bytes::from(pattern(self.pos, n)),
            };
            self.pos += n as u64;
            self.chunk_stalls_left = self.stalls_per_chunk;
            Ok(Some(data))
        })
    }
}

/// Connector whose behavior is scripted per strategy name.
pub struct ScriptedConnector {
    scripts: HashMap<String, Script>,
    pub opened: AtomicUsize,
    live: Arc<AtomicUsize>,
    calls: Mutex<Vec<(String, ByteRange)>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            opened: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(mut self, strategy: &str, script: Script) -> Self {
        self.scripts.insert(strategy.to_string(), script);
        self
    }

    /// Connections handed out and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<(String, ByteRange)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Connector for ScriptedConnector {
    fn connect<'a>(
        &'a self,
        _url: &'a str,
        strategy: &'a Strategy,
        range: ByteRange,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Connection>>> + Send + 'a>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((strategy.name.clone(), range));
            let script = self
                .scripts
                .get(&strategy.name)
                .cloned()
                .unwrap_or(Script::Refuse);

            let (status, body) = match script {
                Script::Refuse => {
                    return Err(Error::Connection {
                        message: format!("connection refused ({})", strategy.name),
                    });
                }
                Script::Status(code) => (code, Body::new(0)),
                Script::Serve(body) => {
                    let partial = !range.is_full() && body.accept_ranges;
                    (if partial { 206 } else { 200 }, body)
                }
            };

            let (start, end) = if status == 206 {
                let end = range.end.map_or(body.len, |e| (e + 1).min(body.len));
                (range.start.min(end), end)
            } else {
                (0, body.len)
            };

            self.opened.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                status,
                content_length: body.declare_length.then_some(end - start),
                accept_ranges: body.accept_ranges,
                pos: start,
                end,
                chunk: body.chunk,
                zeros: body.zeros.then(|| Bytes::from(vec![0u8; body.chunk])),
                stall_at: body.stall_at,
                stalls_left: body.stalls,
                stalls_per_chunk: body.stalls_per_chunk,
                chunk_stalls_left: 0,
                live: Arc::clone(&self.live),
            }) as Box<dyn Connection>)
        })
    }
}

/// Status sink that records what it was asked to show.
#[derive(Default)]
pub struct RecordingStatus {
    shown: Mutex<Vec<String>>,
    cleared: AtomicUsize,
    fail: bool,
}

impl RecordingStatus {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn shown(&self) -> Vec<String> {
        self.shown.lock().unwrap().clone()
    }

    pub fn cleared(&self) -> usize {
        self.cleared.load(Ordering::SeqCst)
    }
}

impl StatusSink for RecordingStatus {
    fn show<'a>(&'a self, text: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.shown.lock().unwrap().push(text.to_string());
            if self.fail {
                return Err(Error::Telegram {
                    message: "Bad Request: message is not modified".to_string(),
                });
            }
            Ok(())
        })
    }

    fn clear<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.cleared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Progress observer that keeps every snapshot.
#[derive(Default)]
pub struct RecordingProgress {
    pub snapshots: Mutex<Vec<ProgressSnapshot>>,
}

impl RecordingProgress {
    pub fn bytes(&self) -> Vec<u64> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.bytes_transferred)
            .collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn on_progress(&self, progress: ProgressSnapshot) {
        self.snapshots.lock().unwrap().push(progress);
    }
}

pub enum FakeResolver {
    Link(ResolvedLink),
    Fail(String),
    /// Never completes.
    Hang,
}

impl LinkResolver for FakeResolver {
    fn name(&self) -> &'static str {
        "test.fake"
    }

    fn resolve<'a>(
        &'a self,
        _source_url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ResolvedLink>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Self::Link(link) => Ok(link.clone()),
                Self::Fail(reason) => Err(Error::ResolutionFailure {
                    reason: reason.clone(),
                }),
                Self::Hang => std::future::pending().await,
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.to_string().into_bytes(),
        }
    }

    pub fn bytes(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: vec![(
                "Content-Type".to_string(),
                "application/octet-stream".to_string(),
            )],
            body,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

pub type Requests = Arc<Mutex<Vec<RecordedRequest>>>;

/// Minimal HTTP/1.1 server on 127.0.0.1:0. One request per connection; bodies are read by
/// Content-Length or chunked encoding.
pub async fn spawn_http<F>(handler: F) -> (String, Requests)
where
    F: Fn(&RecordedRequest) -> MockResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests: Requests = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);

    let recorded = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = Arc::clone(&handler);
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);
                let Some(req) = read_request(&mut reader).await else {
                    return;
                };
                let resp = handler(&req);
                recorded.lock().unwrap().push(req);

                let mut head = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n",
                    resp.status,
                    resp.body.len()
                );
                for (k, v) in &resp.headers {
                    head.push_str(&format!("{k}: {v}\r\n"));
                }
                head.push_str("\r\n");
                let _ = write.write_all(head.as_bytes()).await;
                let _ = write.write_all(&resp.body).await;
                let _ = write.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), requests)
}

async fn read_request<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Option<RecordedRequest> {
    let mut line = String::new();
    reader.read_line(&mut line).await.ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = HashMap::new();
    loop {
        let mut h = String::new();
        reader.read_line(&mut h).await.ok()?;
        let h = h.trim_end();
        if h.is_empty() {
            break;
        }
        if let Some((k, v)) = h.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let mut body = Vec::new();
    if let Some(len) = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        body.resize(len, 0);
        reader.read_exact(&mut body).await.ok()?;
    } else if headers
        .get("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        loop {
            let mut size_line = String::new();
            reader.read_line(&mut size_line).await.ok()?;
            let size = usize::from_str_radix(size_line.trim().split(';').next()?, 16).ok()?;
            if size == 0 {
                let mut trailer = String::new();
                reader.read_line(&mut trailer).await.ok()?;
                break;
            }
            let mut chunk = vec![0u8; size];
            reader.read_exact(&mut chunk).await.ok()?;
            body.extend_from_slice(&chunk);
            let mut crlf = [0u8; 2];
            reader.read_exact(&mut crlf).await.ok()?;
        }
    }

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}
