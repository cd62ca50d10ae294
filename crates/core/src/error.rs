use crate::transport::MediaKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("link resolution failed: {reason}")]
    ResolutionFailure { reason: String },

    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("all connection strategies failed (attempts={attempts})")]
    ResolutionExhausted { attempts: usize },

    #[error("size exceeded: size={size} limit={limit}")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("telegram rejected payload as {kind}: {message}")]
    TransportRejected { kind: MediaKind, message: String },

    #[error("telegram bot api error: {message}")]
    Telegram { message: String },

    #[error("transfer already active: identity={identity}")]
    Busy { identity: String },
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "config.invalid",
            Self::Io(_) => "io",
            Self::ResolutionFailure { .. } => "resolve.failed",
            Self::Connection { .. } => "connection.failed",
            Self::ResolutionExhausted { .. } => "resolve.exhausted",
            Self::SizeExceeded { .. } => "size.exceeded",
            Self::Cancelled => "task.cancelled",
            Self::TransportRejected { .. } => "transport.rejected",
            Self::Telegram { .. } => "telegram.unavailable",
            Self::Busy { .. } => "session.busy",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ResolutionExhausted { .. }
                | Self::Telegram { .. }
                | Self::Busy { .. }
        )
    }

    /// Text shown to the person who asked for the transfer.
    pub fn user_message(&self) -> String {
        match self {
            Self::ResolutionFailure { reason } => format!(
                "Could not get a download link: {reason}\nRefresh the link or credentials and try again later."
            ),
            Self::ResolutionExhausted { attempts } => format!(
                "The file host did not send any data ({attempts} routes tried). Try again later."
            ),
            Self::Connection { message } => {
                format!("Download interrupted: {message}\nSend the link again to restart.")
            }
            Self::SizeExceeded { size, limit } => format!(
                "File is too large: {} (limit {}).",
                bytesize::to_string(*size, true),
                bytesize::to_string(*limit, true)
            ),
            Self::Cancelled => "Transfer cancelled.".to_string(),
            Self::Busy { .. } => {
                "A transfer is already running for you. Wait for it or cancel it first.".to_string()
            }
            Self::TransportRejected { kind, message } => {
                format!("Telegram refused the file as {kind}: {message}")
            }
            Self::Telegram { message } => format!("Upload failed: {message}"),
            Self::InvalidConfig { message } => format!("Bot is misconfigured: {message}"),
            Self::Io(e) => format!("Local error: {e}"),
        }
    }
}
