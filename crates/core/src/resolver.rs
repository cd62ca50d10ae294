use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ResolverKind, ResolverSettings};
use crate::connector::DEFAULT_USER_AGENT;
use crate::{Error, Result};

pub const DEFAULT_COBALT_ENDPOINT: &str = "https://api.cobalt.tools/api/json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLink {
    pub direct_url: String,
    pub filename: Option<String>,
    pub size_bytes: Option<u64>,
}

impl ResolvedLink {
    pub fn new(direct_url: impl Into<String>) -> Self {
        Self {
            direct_url: direct_url.into(),
            filename: None,
            size_bytes: None,
        }
    }

    /// Filename to upload under: the resolver's, else the last URL path segment, else `file`.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.filename.as_deref().map(str::trim)
            && !name.is_empty()
        {
            return name.to_string();
        }
        filename_from_url(&self.direct_url).unwrap_or_else(|| "file".to_string())
    }
}

fn filename_from_url(url: &str) -> Option<String> {
    let url = reqwest::Url::parse(url).ok()?;
    url.path_segments()?
        .rfind(|s| !s.is_empty())
        .map(str::to_string)
}

fn failure(reason: impl Into<String>) -> Error {
    Error::ResolutionFailure {
        reason: reason.into(),
    }
}

/// Turns a source-site URL into a byte-servable one. No retries at this layer.
pub trait LinkResolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve<'a>(
        &'a self,
        source_url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ResolvedLink>> + Send + 'a>>;
}

/// The source URL already serves bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectResolver;

impl LinkResolver for DirectResolver {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn resolve<'a>(
        &'a self,
        source_url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ResolvedLink>> + Send + 'a>> {
        Box::pin(async move {
            let url = reqwest::Url::parse(source_url.trim())
                .map_err(|e| failure(format!("invalid url: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(failure(format!("unsupported url scheme: {}", url.scheme())));
            }
            Ok(ResolvedLink::new(url.to_string()))
        })
    }
}

/// Client for a cobalt-style media API: POST the page URL, get a direct URL back.
pub struct CobaltResolver {
    endpoint: String,
    video_quality: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CobaltRequest<'a> {
    url: &'a str,
    v_codec: &'a str,
    v_quality: &'a str,
    a_format: &'a str,
    filename_pattern: &'a str,
}

#[derive(Debug, Deserialize)]
struct CobaltResponse {
    url: Option<String>,
    text: Option<String>,
    filename: Option<String>,
}

impl CobaltResolver {
    pub fn new(endpoint: impl Into<String>, video_quality: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("http client build failed: {e}"),
            })?;
        Ok(Self {
            endpoint: endpoint.into(),
            video_quality: video_quality.into(),
            client,
        })
    }
}

impl LinkResolver for CobaltResolver {
    fn name(&self) -> &'static str {
        "cobalt"
    }

    fn resolve<'a>(
        &'a self,
        source_url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ResolvedLink>> + Send + 'a>> {
        Box::pin(async move {
            let body = CobaltRequest {
                url: source_url,
                v_codec: "h264",
                v_quality: &self.video_quality,
                a_format: "mp3",
                filename_pattern: "basic",
            };

            let res = self
                .client
                .post(&self.endpoint)
                .header(ACCEPT, "application/json")
                .header(CONTENT_TYPE, "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| failure(format!("api request failed: {e}")))?;

            let status = res.status();
            let text = res
                .text()
                .await
                .map_err(|e| failure(format!("api read failed: {e}")))?;
            let parsed: CobaltResponse = serde_json::from_str(&text)
                .map_err(|_| failure(format!("api http {status}: {text}")))?;

            debug!(
                event = "resolver.response",
                resolver = "cobalt",
                status = status.as_u16(),
                has_url = parsed.url.is_some(),
                "resolver.response"
            );

            match (parsed.url, parsed.text) {
                (Some(url), _) => Ok(ResolvedLink {
                    direct_url: url,
                    filename: parsed.filename,
                    size_bytes: None,
                }),
                (None, Some(text)) => Err(failure(text)),
                (None, None) => Err(failure("unknown api error")),
            }
        })
    }
}

type BlockingResolveFn = dyn Fn(&str) -> Result<ResolvedLink> + Send + Sync;

/// Runs a synchronous resolve function on tokio's blocking pool and awaits its completion.
#[derive(Clone)]
pub struct BlockingResolver {
    name: &'static str,
    resolve: Arc<BlockingResolveFn>,
}

impl BlockingResolver {
    pub fn new(
        name: &'static str,
        resolve: impl Fn(&str) -> Result<ResolvedLink> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            resolve: Arc::new(resolve),
        }
    }

    /// Resolves by running an external extractor, e.g. `["yt-dlp", "-g", "-f", "best"]`.
    /// The source URL is appended as the last argument; the first non-empty stdout line is the
    /// direct URL.
    pub fn command(argv: Vec<String>) -> Result<Self> {
        if argv.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(Error::InvalidConfig {
                message: "resolver.command must name a program".to_string(),
            });
        }
        Ok(Self::new("command", move |source_url| {
            run_extractor(&argv, source_url)
        }))
    }
}

fn run_extractor(argv: &[String], source_url: &str) -> Result<ResolvedLink> {
    let output = std::process::Command::new(&argv[0])
        .args(&argv[1..])
        .arg(source_url)
        .stdin(std::process::Stdio::null())
        .output()
        .map_err(|e| failure(format!("failed to run {}: {e}", argv[0])))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("extractor failed")
            .trim()
            .to_string();
        return Err(failure(format!("{} exited with {}: {reason}", argv[0], output.status)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let url = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| failure(format!("{} printed no url", argv[0])))?;
    Ok(ResolvedLink::new(url))
}

impl LinkResolver for BlockingResolver {
    fn name(&self) -> &'static str {
        self.name
    }

    fn resolve<'a>(
        &'a self,
        source_url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ResolvedLink>> + Send + 'a>> {
        Box::pin(async move {
            let resolve = Arc::clone(&self.resolve);
            let url = source_url.to_string();
            tokio::task::spawn_blocking(move || resolve(&url))
                .await
                .map_err(|e| failure(format!("resolver worker failed: {e}")))?
        })
    }
}

pub fn build_resolver(settings: &ResolverSettings) -> Result<Arc<dyn LinkResolver>> {
    Ok(match settings.kind {
        ResolverKind::Direct => Arc::new(DirectResolver),
        ResolverKind::Cobalt => Arc::new(CobaltResolver::new(
            settings.endpoint.clone(),
            settings.video_quality.clone(),
        )?),
        ResolverKind::Command => Arc::new(BlockingResolver::command(settings.command.clone())?),
    })
}
