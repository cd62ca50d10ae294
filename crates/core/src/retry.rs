use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Upper bound on read-timeout retries for a single chunk.
pub const MAX_READ_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[default]
    Any,
    V4,
    V6,
}

/// One way of reaching a direct URL: a network route plus the headers sent along it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub ip_family: IpFamily,
}

impl Strategy {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            proxy: None,
            headers: BTreeMap::new(),
            ip_family: IpFamily::Any,
        }
    }

    pub fn direct() -> Self {
        Self::named("direct")
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_ip_family(mut self, family: IpFamily) -> Self {
        self.ip_family = family;
        self
    }
}

/// Ordered connection strategies. The first one whose probe read yields data is adopted for the
/// rest of the transfer.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    strategies: Vec<Strategy>,
}

impl RetryPolicy {
    pub fn new(strategies: Vec<Strategy>) -> Result<Self> {
        if strategies.is_empty() {
            return Err(Error::InvalidConfig {
                message: "retry policy needs at least one strategy".to_string(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for s in &strategies {
            if s.name.trim().is_empty() {
                return Err(Error::InvalidConfig {
                    message: "strategy name must not be empty".to_string(),
                });
            }
            if !seen.insert(s.name.as_str()) {
                return Err(Error::InvalidConfig {
                    message: format!("duplicate strategy name: {}", s.name),
                });
            }
        }
        Ok(Self { strategies })
    }

    pub fn direct() -> Self {
        Self {
            strategies: vec![Strategy::direct()],
        }
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

/// Bounded, linearly backed-off retry of stalled reads on an adopted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRetry {
    max_retries: u32,
    backoff: Duration,
}

impl ReadRetry {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries: max_retries.min(MAX_READ_RETRIES),
            backoff,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

impl Default for ReadRetry {
    fn default() -> Self {
        Self::new(MAX_READ_RETRIES, Duration::from_secs(1))
    }
}
