//! Advisory per-lottery run lock with a time-to-live, built on
//! `StateStore::compare_and_swap`.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::StateStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct RunLock {
    store: Arc<dyn StateStore>,
    key: String,
    raw: String,
    record: LockRecord,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock")
            .field("key", &self.key)
            .field("record", &self.record)
            .finish()
    }
}

impl RunLock {
    pub fn key_for(lottery_key: &str) -> String {
        format!("locks/{lottery_key}")
    }

    /// Returns `None` when another live holder owns the lock. A lock past
    /// its `expires_at` is treated as abandoned and taken over.
    pub async fn acquire(
        store: Arc<dyn StateStore>,
        lottery_key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<RunLock>> {
        let key = Self::key_for(lottery_key);
        let record = LockRecord {
            owner: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        let raw = serde_json::to_string(&record).context("serializing lock record")?;

        for _ in 0..2 {
            if store.compare_and_swap(&key, None, Some(&raw)).await? {
                debug!(lock = %key, owner = %record.owner, "lock acquired");
                return Ok(Some(RunLock {
                    store,
                    key,
                    raw,
                    record,
                }));
            }

            let Some(current) = store.get(&key).await? else {
                // Released between our two calls.
                continue;
            };

            let stale = match serde_json::from_str::<LockRecord>(&current) {
                Ok(held) if held.expires_at > now => {
                    debug!(
                        lock = %key,
                        holder = %held.owner,
                        expires_at = %held.expires_at,
                        "lock held"
                    );
                    return Ok(None);
                }
                Ok(held) => Some(held.owner),
                Err(_) => None,
            };

            if store
                .compare_and_swap(&key, Some(&current), Some(&raw))
                .await?
            {
                warn!(lock = %key, previous_owner = ?stale, "reclaimed stale lock");
                return Ok(Some(RunLock {
                    store,
                    key,
                    raw,
                    record,
                }));
            }
            return Ok(None);
        }
        Ok(None)
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Releases the lock if this holder still owns it.
    pub async fn release(self) -> Result<bool> {
        let released = self
            .store
            .compare_and_swap(&self.key, Some(&self.raw), None)
            .await?;
        if !released {
            warn!(
                lock = %self.key,
                owner = %self.record.owner,
                "lock was taken over before release"
            );
        }
        Ok(released)
    }
}
