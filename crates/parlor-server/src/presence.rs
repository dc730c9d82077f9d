//! In-memory presence with write-through to the user table.
//!
//! The tracker's map is the source of truth while the process runs. Every
//! transition is mirrored to the store by a spawned task that retries with
//! exponential backoff; a failed mirror write is logged and never rolls
//! back the in-memory state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use parlor_shared::UserId;
use parlor_store::StoreError;

use crate::store::Store;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

/// Retry schedule for mirror writes: `base_delay * 2^n` between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    mut op: F,
    is_transient: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < attempts && is_transient(&e) => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct PresenceTracker {
    entries: RwLock<HashMap<UserId, PresenceEntry>>,
    /// Orders mirror writes that share a `last_seen`.
    seq: AtomicU64,
    mirror: Option<Store>,
    retry: RetryPolicy,
}

impl PresenceTracker {
    /// A tracker that mirrors transitions into `store`.
    pub fn new(store: Store, retry: RetryPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            mirror: Some(store),
            retry,
        }
    }

    /// A tracker without a persisted mirror.
    pub fn detached() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            mirror: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn mark_online(&self, user: UserId) -> PresenceEntry {
        self.transition(user, true)
    }

    pub fn mark_offline(&self, user: UserId) -> PresenceEntry {
        self.transition(user, false)
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .map_or(false, |e| e.online)
    }

    pub fn get(&self, user: UserId) -> Option<PresenceEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .copied()
    }

    /// Entries for the given users that the tracker has seen.
    pub fn snapshot(&self, users: &[UserId]) -> HashMap<UserId, PresenceEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        users
            .iter()
            .filter_map(|id| entries.get(id).map(|e| (*id, *e)))
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.online)
            .count()
    }

    fn transition(&self, user: UserId, online: bool) -> PresenceEntry {
        let (entry, seq) = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            // last_seen never moves backwards for a user, even if the clock does.
            let mut last_seen = now_micros();
            if let Some(prev) = entries.get(&user) {
                last_seen = last_seen.max(prev.last_seen);
            }
            let entry = PresenceEntry {
                user_id: user,
                online,
                last_seen,
            };
            entries.insert(user, entry);
            (entry, self.seq.fetch_add(1, Ordering::Relaxed) + 1)
        };
        debug!(user = %user, online, seq, "presence changed");

        self.write_through(entry, seq);
        entry
    }

    fn write_through(&self, entry: PresenceEntry, seq: u64) {
        let Some(store) = self.mirror.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(user = %entry.user_id, "no runtime, presence not persisted");
            return;
        };
        let policy = self.retry;

        runtime.spawn(async move {
            let result = retry_with_backoff(
                policy,
                || {
                    let store = store.clone();
                    async move {
                        store
                            .call(move |db| {
                                db.set_presence(entry.user_id, entry.online, entry.last_seen, seq)
                            })
                            .await
                    }
                },
                StoreError::is_persistence,
            )
            .await;

            match result {
                Ok(true) => {}
                Ok(false) => debug!(user = %entry.user_id, "stale presence write skipped"),
                Err(e) => warn!(
                    user = %entry.user_id,
                    online = entry.online,
                    error = %e,
                    "failed to persist presence"
                ),
            }
        });
    }
}

/// Current time at the precision the store keeps, so in-memory and mirrored
/// timestamps compare equal.
fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
