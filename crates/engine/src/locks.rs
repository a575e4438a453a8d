//! Per-user write serialization.
//!
//! Every read-modify-write of a user record (channel outcomes, history
//! appends, topic membership, preferences) runs under that user's lock.
//! Writes for different users never contend. A user's entry is dropped once
//! its last holder releases it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type LockMap = DashMap<Uuid, Arc<Mutex<()>>>;

/// Held lock for one user; releasing it prunes the entry when nobody waits.
pub struct UserLockGuard<'a> {
    locks: &'a LockMap,
    user_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone of the Arc, so a count of one means only the map is left.
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Default)]
pub struct UserLocks {
    locks: LockMap,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `user_id`, waiting for any in-flight writer.
    pub async fn lock(&self, user_id: Uuid) -> UserLockGuard<'_> {
        // Clone the Arc out so the dashmap shard guard is not held across the await.
        let lock = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        UserLockGuard {
            locks: &self.locks,
            user_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of users with an allocated lock (for monitoring).
    pub fn tracked_count(&self) -> usize {
        self.locks.len()
    }
}
