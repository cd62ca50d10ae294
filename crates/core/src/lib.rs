pub mod adapter;
pub mod config;
pub mod connector;
pub mod control;
mod error;
pub mod pipeline;
pub mod progress;
pub mod resolver;
pub mod retry;
pub mod run_log;
pub mod session;
pub mod source;
pub mod stage;
pub mod transport;

pub const APP_NAME: &str = "tgrelay";

pub use adapter::{TransferAdapter, TransferRequest, TransferState};
pub use connector::{ByteRange, Connection, Connector, HttpConnector, HttpConnectorConfig};
pub use error::{Error, Result};
pub use pipeline::{Relay, RelayOptions, RelayReport, RelayRequest};
pub use progress::{
    LogStatusSink, ProgressCallback, ProgressReporter, ProgressSink, ProgressSnapshot, StatusSink,
};
pub use resolver::{
    BlockingResolver, CobaltResolver, DirectResolver, LinkResolver, ResolvedLink, build_resolver,
};
pub use retry::{IpFamily, ReadRetry, RetryPolicy, Strategy};
pub use session::{CancelFlag, SessionGuard, SessionRegistry, SessionState, SessionStatus};
pub use source::{FileSource, MemorySource, PullSource, SourceLength};
pub use transport::{
    ChatTransport, InMemoryTransport, MediaKind, SentMessage, TelegramBotApi,
    TelegramBotApiTransport, TelegramStatusMessage,
};
