//! Bounded per-user delivery history, newest first.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use nudge_common::error::NotifyError;
use nudge_common::types::{HistoryEntry, MAX_HISTORY_ENTRIES};

use crate::locks::UserLocks;
use crate::store::UserStore;

/// One page of a user's history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub entries: Vec<HistoryEntry>,
    pub total: usize,
    pub has_more: bool,
}

pub struct HistoryLog {
    store: Arc<dyn UserStore>,
    locks: Arc<UserLocks>,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn UserStore>, locks: Arc<UserLocks>) -> Self {
        Self { store, locks }
    }

    /// Prepend an entry, dropping the oldest beyond `MAX_HISTORY_ENTRIES`.
    pub async fn append(&self, user_id: Uuid, entry: HistoryEntry) -> Result<(), NotifyError> {
        let _guard = self.locks.lock(user_id).await;
        let mut user = self.store.require(user_id).await?;

        user.history.push_front(entry);
        user.history.truncate(MAX_HISTORY_ENTRIES);

        self.store.save(&user).await
    }

    pub async fn page(
        &self,
        user_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<HistoryPage, NotifyError> {
        if limit == 0 || limit > MAX_HISTORY_ENTRIES {
            return Err(NotifyError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_HISTORY_ENTRIES
            )));
        }

        let user = self.store.require(user_id).await?;
        let total = user.history.len();
        let entries: Vec<HistoryEntry> = user
            .history
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();

        Ok(HistoryPage {
            has_more: offset.saturating_add(entries.len()) < total,
            entries,
            total,
        })
    }
}
