//! Per-record write serialization
//!
//! Read-modify-write sequences on a record (access bumps, decay write-back,
//! importance changes, the move out of a tier) hold the record's lock, so at
//! most one write per identifier is outstanding. Callers take any
//! backpressure permit before the record lock, never after.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async locks, one per record identifier currently in use
#[derive(Debug, Default)]
pub struct RecordLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to `id`
    pub async fn lock(&self, id: &str) -> RecordLockGuard {
        let mutex = Arc::clone(
            self.locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = mutex.lock_owned().await;
        RecordLockGuard {
            id: id.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Identifiers with a held or awaited lock
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

/// Held write access to one record; released on drop
#[derive(Debug)]
pub struct RecordLockGuard {
    id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RecordLockGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for RecordLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map still references the mutex: nobody holds or awaits it
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
