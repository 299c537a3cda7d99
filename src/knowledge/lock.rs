//! Per-file ingestion locks
//!
//! Serializes ingestion (and deletion) of the same (owner, file name) pair.
//! Different files never contend. Map entries only live while someone holds
//! or waits on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockKey = (i64, String);
type LockMap = HashMap<LockKey, Arc<AsyncMutex<()>>>;

/// Advisory lock table keyed by (owner id, file name)
#[derive(Clone, Default)]
pub struct IngestLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Held for the duration of one ingestion
pub struct IngestGuard {
    // declaration order: the mutex is released before the lease prunes
    _guard: OwnedMutexGuard<()>,
    _lease: SlotLease,
}

/// Interest in one map entry, taken before waiting; dropping it (after the
/// lock is released or the wait abandoned) removes the entry once idle
struct SlotLease {
    key: LockKey,
    table: Arc<Mutex<LockMap>>,
}

impl IngestLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `(owner_id, file_name)`
    pub async fn acquire(&self, owner_id: i64, file_name: &str) -> IngestGuard {
        let key = (owner_id, file_name.to_string());

        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let lease = SlotLease {
            key,
            table: Arc::clone(&self.inner),
        };
        let guard = slot.lock_owned().await;

        IngestGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Number of (owner, file) pairs currently locked or awaited
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let mut map = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = map
            .get(&self.key)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false);
        if idle {
            map.remove(&self.key);
        }
    }
}
