//! Result cache: atomic claims plus short-lived task status.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use geoanomaly_core::{Clock, SystemClock, TaskId, TaskState};

use crate::error::QueueError;

/// What a claim guards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClaimKey {
    /// Dedup window for submitting a task ID.
    Submission(TaskId),
    /// At most one running execution of a task ID.
    Execution(TaskId),
    /// At most one scheduler sweep at a time.
    SweepLease,
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimKey::Submission(id) => write!(f, "submit:{id}"),
            ClaimKey::Execution(id) => write!(f, "exec:{id}"),
            ClaimKey::SweepLease => f.write_str("sweep-lease"),
        }
    }
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Atomically take `key` for `ttl` if no unexpired claim exists.
    async fn try_claim(&self, key: &ClaimKey, holder: &str, ttl: Duration)
        -> Result<bool, QueueError>;

    /// Drop a claim, but only if `holder` still owns it.
    async fn release(&self, key: &ClaimKey, holder: &str) -> Result<(), QueueError>;

    async fn set_status(&self, state: &TaskState) -> Result<(), QueueError>;

    async fn get_status(&self, task_id: &TaskId) -> Result<Option<TaskState>, QueueError>;

    /// Count a rejected resubmission against the task's cached state.
    async fn note_duplicate(&self, task_id: &TaskId) -> Result<(), QueueError>;

    /// All unexpired task states, ordered by task ID.
    async fn snapshot(&self) -> Result<Vec<TaskState>, QueueError>;
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

struct Claim {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Entries {
    claims: HashMap<String, Claim>,
    states: HashMap<TaskId, (TaskState, DateTime<Utc>)>,
}

/// Process-local result cache. Expiry follows the injected clock.
pub struct InMemoryResultCache {
    clock: Arc<dyn Clock>,
    status_ttl: Duration,
    entries: Mutex<Entries>,
}

impl InMemoryResultCache {
    pub fn new(clock: Arc<dyn Clock>, status_ttl: Duration) -> Self {
        Self {
            clock,
            status_ttl,
            entries: Mutex::new(Entries::default()),
        }
    }
}

impl Default for InMemoryResultCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Duration::from_secs(86_400))
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn try_claim(
        &self,
        key: &ClaimKey,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let key = key.to_string();
        if let Some(existing) = entries.claims.get(&key) {
            if existing.expires_at > now {
                debug!(claim = %key, holder = %existing.holder, "Claim already held");
                return Ok(false);
            }
        }
        entries.claims.insert(
            key,
            Claim {
                holder: holder.to_string(),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &ClaimKey, holder: &str) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        let key = key.to_string();
        if entries
            .claims
            .get(&key)
            .is_some_and(|claim| claim.holder == holder)
        {
            entries.claims.remove(&key);
        }
        Ok(())
    }

    async fn set_status(&self, state: &TaskState) -> Result<(), QueueError> {
        let expires_at = expiry(self.clock.now(), self.status_ttl);
        let mut entries = self.entries.lock().await;
        entries
            .states
            .insert(state.task_id().clone(), (state.clone(), expires_at));
        Ok(())
    }

    async fn get_status(&self, task_id: &TaskId) -> Result<Option<TaskState>, QueueError> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(entries
            .states
            .get(task_id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(state, _)| state.clone()))
    }

    async fn note_duplicate(&self, task_id: &TaskId) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        if let Some((state, _)) = entries.states.get_mut(task_id) {
            state.duplicate_submissions += 1;
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<TaskState>, QueueError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.states.retain(|_, (_, expires_at)| *expires_at > now);
        let mut states: Vec<TaskState> =
            entries.states.values().map(|(s, _)| s.clone()).collect();
        states.sort_by(|a, b| a.task_id().cmp(b.task_id()));
        Ok(states)
    }
}
