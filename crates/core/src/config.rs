use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::resolver::DEFAULT_COBALT_ENDPOINT;
use crate::retry::{MAX_READ_RETRIES, ReadRetry, RetryPolicy, Strategy};
use crate::transport::MediaKind;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

/// Cloud Bot API upload ceiling.
pub const BOT_API_UPLOAD_MAX_BYTES: u64 = 50 * 1024 * 1024;
/// Ceiling of a self-hosted Bot API server.
pub const LOCAL_BOT_API_UPLOAD_MAX_BYTES: u64 = 2_000_000_000;

pub const PROGRESS_INTERVAL_MIN_MS: u64 = 1500;
pub const PROGRESS_INTERVAL_MAX_MS: u64 = 5000;
pub const STAGE_PARTS_MAX: u32 = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub progress: ProgressSettings,
    #[serde(default)]
    pub telegram: TelegramSettings,
    #[serde(default)]
    pub resolver: ResolverSettings,
    #[serde(default)]
    pub strategies: Vec<Strategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Deliver the first `max_bytes` and flag the result as truncated.
    #[default]
    Truncate,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingMode {
    #[default]
    Stream,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub chunk_bytes: u32,
    pub probe_bytes: u32,
    pub max_bytes: u64,
    pub oversize: OversizePolicy,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub read_retries: u32,
    pub read_backoff_ms: u64,
    pub staging: StagingMode,
    pub stage_parts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSettings {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub api_base: String,
    /// Name of the environment variable holding the bot token.
    pub bot_token_env: String,
    pub default_kind: MediaKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    #[default]
    Direct,
    Cobalt,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    pub kind: ResolverKind,
    pub endpoint: String,
    pub video_quality: String,
    /// Extractor argv for `kind = "command"`; the source URL is appended.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_bytes: 512 * 1024,
            probe_bytes: 1024,
            max_bytes: BOT_API_UPLOAD_MAX_BYTES,
            oversize: OversizePolicy::Truncate,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            read_retries: MAX_READ_RETRIES,
            read_backoff_ms: 1000,
            staging: StagingMode::Stream,
            stage_parts: 4,
        }
    }
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self { interval_ms: 3000 }
    }
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            bot_token_env: "TGRELAY_BOT_TOKEN".to_string(),
            default_kind: MediaKind::Video,
        }
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            kind: ResolverKind::Direct,
            endpoint: DEFAULT_COBALT_ENDPOINT.to_string(),
            video_quality: "1080".to_string(),
            command: Vec::new(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            transfer: TransferSettings::default(),
            progress: ProgressSettings::default(),
            telegram: TelegramSettings::default(),
            resolver: ResolverSettings::default(),
            strategies: vec![Strategy::direct()],
        }
    }
}

impl Settings {
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(self.strategies.clone())
    }

    pub fn read_retry(&self) -> ReadRetry {
        ReadRetry::new(
            self.transfer.read_retries,
            Duration::from_millis(self.transfer.read_backoff_ms),
        )
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress.interval_ms)
    }

    /// Reads the bot token from the environment variable named in `telegram.bot_token_env`.
    pub fn bot_token(&self) -> Result<String> {
        let var = self.telegram.bot_token_env.trim();
        match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
            _ => Err(Error::InvalidConfig {
                message: format!("bot token missing: set {var}"),
            }),
        }
    }
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(v) = std::env::var("TGRELAY_CONFIG_DIR") {
        return PathBuf::from(v);
    }
    home_dir().join(".config").join(crate::APP_NAME)
}

pub fn default_data_dir() -> PathBuf {
    if let Ok(v) = std::env::var("TGRELAY_DATA_DIR") {
        return PathBuf::from(v);
    }
    home_dir().join(".local").join("share").join(crate::APP_NAME)
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => {
            let mut s = toml::from_str::<Settings>(text)?;
            normalize_settings(&mut s);
            Ok(s)
        }
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings schema version")),
    }
}

fn normalize_settings(settings: &mut Settings) {
    if settings.strategies.is_empty() {
        settings.strategies.push(Strategy::direct());
    }
    for s in &mut settings.strategies {
        s.name = s.name.trim().to_string();
    }
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    let text = to_toml(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    let invalid = |message: String| Err(Error::InvalidConfig { message });

    if settings.version != SETTINGS_SCHEMA_VERSION {
        return invalid(format!(
            "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
            settings.version
        ));
    }

    let t = &settings.transfer;
    if t.probe_bytes == 0 {
        return invalid("transfer.probe_bytes must be > 0".to_string());
    }
    if t.chunk_bytes < t.probe_bytes {
        return invalid(format!(
            "transfer.chunk_bytes must be >= probe_bytes (chunk_bytes={}, probe_bytes={})",
            t.chunk_bytes, t.probe_bytes
        ));
    }
    if t.max_bytes == 0 || t.max_bytes > LOCAL_BOT_API_UPLOAD_MAX_BYTES {
        return invalid(format!(
            "transfer.max_bytes must be 1..={LOCAL_BOT_API_UPLOAD_MAX_BYTES} (got {})",
            t.max_bytes
        ));
    }
    if t.connect_timeout_secs == 0 || t.read_timeout_secs == 0 {
        return invalid("transfer timeouts must be > 0".to_string());
    }
    if t.read_retries > MAX_READ_RETRIES {
        return invalid(format!(
            "transfer.read_retries must be <= {MAX_READ_RETRIES} (got {})",
            t.read_retries
        ));
    }
    if !(1..=STAGE_PARTS_MAX).contains(&t.stage_parts) {
        return invalid(format!(
            "transfer.stage_parts must be 1..={STAGE_PARTS_MAX} (got {})",
            t.stage_parts
        ));
    }

    let interval = settings.progress.interval_ms;
    if !(PROGRESS_INTERVAL_MIN_MS..=PROGRESS_INTERVAL_MAX_MS).contains(&interval) {
        return invalid(format!(
            "progress.interval_ms must be {PROGRESS_INTERVAL_MIN_MS}..={PROGRESS_INTERVAL_MAX_MS} (got {interval})"
        ));
    }

    if settings.telegram.api_base.trim().is_empty() {
        return invalid("telegram.api_base must not be empty".to_string());
    }
    if settings.telegram.bot_token_env.trim().is_empty() {
        return invalid("telegram.bot_token_env must not be empty".to_string());
    }

    match settings.resolver.kind {
        ResolverKind::Direct => {}
        ResolverKind::Cobalt => {
            if settings.resolver.endpoint.trim().is_empty() {
                return invalid("resolver.endpoint must not be empty".to_string());
            }
        }
        ResolverKind::Command => {
            if settings
                .resolver
                .command
                .first()
                .is_none_or(|p| p.trim().is_empty())
            {
                return invalid("resolver.command must name a program".to_string());
            }
        }
    }

    // Strategy names, proxies, and headers.
    RetryPolicy::new(settings.strategies.clone())?;

    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
