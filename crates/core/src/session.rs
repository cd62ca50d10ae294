use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Error, Result};

/// Cooperative cancellation flag for one transfer. Checked at chunk boundaries and progress
/// checkpoints, never preemptive.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    token: CancellationToken,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the flag is set.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Completed,
            Err(Error::Cancelled) => Self::Cancelled,
            Err(_) => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub last_outcome: Option<SessionState>,
}

#[derive(Debug)]
struct SessionEntry {
    state: SessionState,
    last_outcome: Option<SessionState>,
    cancel: CancelFlag,
    generation: u64,
}

/// Per-identity transfer bookkeeping owned by the top-level session manager.
///
/// At most one transfer per identity is active; a second `begin` is rejected with
/// [`Error::Busy`]. Entries are kept for the life of the registry.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `identity` active and hands out a fresh (unset) cancel flag.
    pub fn begin(self: &Arc<Self>, identity: &str) -> Result<SessionGuard> {
        let mut map = self.lock();
        let entry = map.entry(identity.to_string()).or_insert_with(|| SessionEntry {
            state: SessionState::Idle,
            last_outcome: None,
            cancel: CancelFlag::new(),
            generation: 0,
        });

        if entry.state == SessionState::Active {
            info!(event = "session.busy", identity, "session.busy");
            return Err(Error::Busy {
                identity: identity.to_string(),
            });
        }

        entry.state = SessionState::Active;
        entry.cancel = CancelFlag::new();
        entry.generation += 1;
        debug!(
            event = "session.begin",
            identity,
            generation = entry.generation,
            "session.begin"
        );

        Ok(SessionGuard {
            registry: Arc::clone(self),
            identity: identity.to_string(),
            cancel: entry.cancel.clone(),
            generation: entry.generation,
            finished: false,
        })
    }

    /// Sets the cancel flag of the active transfer for `identity`. Returns whether one was active.
    pub fn cancel(&self, identity: &str) -> bool {
        let map = self.lock();
        match map.get(identity) {
            Some(entry) if entry.state == SessionState::Active => {
                entry.cancel.cancel();
                info!(event = "session.cancel", identity, "session.cancel");
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, identity: &str) -> SessionStatus {
        let map = self.lock();
        match map.get(identity) {
            Some(entry) => SessionStatus {
                state: entry.state,
                last_outcome: entry.last_outcome,
            },
            None => SessionStatus {
                state: SessionState::Idle,
                last_outcome: None,
            },
        }
    }

    pub fn is_active(&self, identity: &str) -> bool {
        self.status(identity).state == SessionState::Active
    }

    fn end(&self, identity: &str, generation: u64, outcome: SessionState) {
        let mut map = self.lock();
        if let Some(entry) = map.get_mut(identity)
            && entry.generation == generation
        {
            entry.last_outcome = Some(outcome);
            entry.state = SessionState::Idle;
            debug!(
                event = "session.end",
                identity,
                outcome = outcome.as_str(),
                "session.end"
            );
        }
    }
}

/// Active-transfer token. Finishing (or dropping) it moves the identity back to idle.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    identity: String,
    cancel: CancelFlag,
    generation: u64,
    finished: bool,
}

impl SessionGuard {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Records the outcome of `result` and releases the identity.
    pub fn finish<T>(mut self, result: &Result<T>) {
        let outcome = SessionState::from_result(result);
        self.registry.end(&self.identity, self.generation, outcome);
        self.finished = true;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let outcome = if self.cancel.is_cancelled() {
            SessionState::Cancelled
        } else {
            SessionState::Failed
        };
        self.registry.end(&self.identity, self.generation, outcome);
    }
}
