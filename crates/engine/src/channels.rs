//! Channel registry: per-user device channels and their health.
//!
//! A user keeps at most `MAX_CHANNELS_PER_USER` channels; overflow evicts the
//! least recently used. Send outcomes feed back into each channel:
//! - success resets `error_count` and bumps `last_used_at`
//! - a permanent failure deactivates the channel immediately
//! - transient failures accumulate until `CHANNEL_ERROR_THRESHOLD`
//!
//! Inactive channels are skipped by dispatch but kept until unregistered.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use nudge_common::error::NotifyError;
use nudge_common::types::{
    CHANNEL_ERROR_THRESHOLD, Channel, DeviceInfo, MAX_CHANNELS_PER_USER, User, token_prefix,
};

use crate::locks::UserLocks;
use crate::store::UserStore;

/// Result of a single send attempt on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOutcome {
    pub token: String,
    pub success: bool,
    pub permanent_failure: bool,
}

impl ChannelOutcome {
    pub fn success(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            success: true,
            permanent_failure: false,
        }
    }

    pub fn failure(token: impl Into<String>, permanent: bool) -> Self {
        Self {
            token: token.into(),
            success: false,
            permanent_failure: permanent,
        }
    }
}

pub struct ChannelRegistry {
    store: Arc<dyn UserStore>,
    locks: Arc<UserLocks>,
}

impl ChannelRegistry {
    pub fn new(store: Arc<dyn UserStore>, locks: Arc<UserLocks>) -> Self {
        Self { store, locks }
    }

    /// Register `token` for a user, or refresh it if already known.
    ///
    /// Returns the user's channel count after eviction.
    pub async fn register(
        &self,
        user_id: Uuid,
        token: &str,
        device_info: DeviceInfo,
    ) -> Result<usize, NotifyError> {
        if token.trim().is_empty() {
            return Err(NotifyError::Validation("channel token is required".to_string()));
        }

        let _guard = self.locks.lock(user_id).await;
        let mut user = self.store.require(user_id).await?;
        let now = Utc::now();

        let evicted = Self::upsert(&mut user, token, device_info, now);
        self.store.save(&user).await?;

        if !evicted.is_empty() {
            tracing::info!(
                user_id = %user_id,
                evicted = evicted.len(),
                "Evicted least recently used channels"
            );
        }
        tracing::info!(
            user_id = %user_id,
            token = token_prefix(token),
            channels = user.channels.len(),
            "Channel registered"
        );

        Ok(user.channels.len())
    }

    /// Remove a channel. Returns `false` if the token was not registered.
    pub async fn unregister(&self, user_id: Uuid, token: &str) -> Result<bool, NotifyError> {
        let _guard = self.locks.lock(user_id).await;
        let mut user = self.store.require(user_id).await?;

        let before = user.channels.len();
        user.channels.retain(|c| c.token != token);
        let removed = user.channels.len() < before;

        if removed {
            self.store.save(&user).await?;
            tracing::info!(user_id = %user_id, token = token_prefix(token), "Channel unregistered");
        }

        Ok(removed)
    }

    /// Active channels, most recently used first.
    pub async fn list_active(&self, user_id: Uuid) -> Result<Vec<Channel>, NotifyError> {
        let user = self.store.require(user_id).await?;
        Ok(Self::active_channels(&user))
    }

    /// All channels including deactivated ones.
    pub async fn list_all(&self, user_id: Uuid) -> Result<Vec<Channel>, NotifyError> {
        let user = self.store.require(user_id).await?;
        Ok(user.channels)
    }

    pub async fn record_outcome(
        &self,
        user_id: Uuid,
        token: &str,
        success: bool,
        permanent_failure: bool,
    ) -> Result<(), NotifyError> {
        let outcome = ChannelOutcome {
            token: token.to_string(),
            success,
            permanent_failure,
        };
        self.record_outcomes(user_id, std::slice::from_ref(&outcome))
            .await
    }

    /// Apply several outcomes for one user in a single locked write.
    pub async fn record_outcomes(
        &self,
        user_id: Uuid,
        outcomes: &[ChannelOutcome],
    ) -> Result<(), NotifyError> {
        if outcomes.is_empty() {
            return Ok(());
        }

        let _guard = self.locks.lock(user_id).await;
        let mut user = self.store.require(user_id).await?;
        let now = Utc::now();

        for outcome in outcomes {
            let Some(channel) = user.channels.iter_mut().find(|c| c.token == outcome.token)
            else {
                // Unregistered while the send was in flight.
                tracing::debug!(
                    user_id = %user_id,
                    token = token_prefix(&outcome.token),
                    "Outcome for unknown channel ignored"
                );
                continue;
            };
            Self::apply_outcome(channel, outcome, now, user_id);
        }

        self.store.save(&user).await
    }

    /// Active channels of an already-loaded user, most recently used first.
    pub fn active_channels(user: &User) -> Vec<Channel> {
        let mut active: Vec<Channel> = user.channels.iter().filter(|c| c.active).cloned().collect();
        active.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        active
    }

    /// Insert or refresh a channel and enforce the per-user cap.
    ///
    /// Returns the evicted channels.
    fn upsert(
        user: &mut User,
        token: &str,
        device_info: DeviceInfo,
        now: DateTime<Utc>,
    ) -> Vec<Channel> {
        let channel = match user.channels.iter().position(|c| c.token == token) {
            Some(pos) => {
                let mut existing = user.channels.remove(pos);
                existing.device_info = device_info;
                existing.active = true;
                existing.deactivated_at = None;
                existing.last_used_at = now;
                existing
            }
            None => Channel::new(token, device_info, now),
        };
        // Most recently touched channel goes last so ties evict older entries first.
        user.channels.push(channel);

        let mut evicted = Vec::new();
        if user.channels.len() > MAX_CHANNELS_PER_USER {
            user.channels.sort_by_key(|c| c.last_used_at);
            let excess = user.channels.len() - MAX_CHANNELS_PER_USER;
            evicted = user.channels.drain(..excess).collect();
        }
        evicted
    }

    fn apply_outcome(
        channel: &mut Channel,
        outcome: &ChannelOutcome,
        now: DateTime<Utc>,
        user_id: Uuid,
    ) {
        if outcome.success {
            channel.success_count += 1;
            channel.error_count = 0;
            channel.last_used_at = now;
            return;
        }

        if outcome.permanent_failure {
            channel.deactivate(now);
            tracing::warn!(
                user_id = %user_id,
                token = token_prefix(&channel.token),
                "Channel deactivated: token rejected as invalid"
            );
            return;
        }

        channel.error_count += 1;
        if channel.error_count >= CHANNEL_ERROR_THRESHOLD && channel.active {
            channel.deactivate(now);
            tracing::warn!(
                user_id = %user_id,
                token = token_prefix(&channel.token),
                error_count = channel.error_count,
                "Channel deactivated: error threshold reached"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryUserStore;
    use chrono::Duration;

    fn setup() -> (ChannelRegistry, Arc<InMemoryUserStore>) {
        let store = Arc::new(InMemoryUserStore::new());
        let registry = ChannelRegistry::new(store.clone(), Arc::new(UserLocks::new()));
        (registry, store)
    }

    async fn seeded_user(store: &InMemoryUserStore) -> Uuid {
        let id = Uuid::new_v4();
        store.insert(User::new(id)).await;
        id
    }

    fn android() -> DeviceInfo {
        DeviceInfo {
            platform: Some("android".to_string()),
            device_type: Some("phone".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_evicts_least_recently_used() {
        let mut user = User::new(Uuid::new_v4());
        let start = Utc::now();
        for i in 0..6 {
            let at = start + Duration::seconds(i);
            upsert_at(&mut user, &format!("tok-{i}"), at);
        }
        assert_eq!(user.channels.len(), MAX_CHANNELS_PER_USER);
        assert!(!user.channels.iter().any(|c| c.token == "tok-0"));
    }

    fn upsert_at(user: &mut User, token: &str, at: DateTime<Utc>) -> Vec<Channel> {
        ChannelRegistry::upsert(user, token, DeviceInfo::default(), at)
    }

    #[test]
    fn test_refresh_moves_channel_out_of_eviction_order() {
        let mut user = User::new(Uuid::new_v4());
        let start = Utc::now();
        for i in 0..5 {
            upsert_at(&mut user, &format!("tok-{i}"), start + Duration::seconds(i));
        }
        // Touch tok-0 so tok-1 becomes the oldest.
        upsert_at(&mut user, "tok-0", start + Duration::seconds(10));
        let evicted = upsert_at(&mut user, "tok-5", start + Duration::seconds(11));

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].token, "tok-1");
        assert!(user.channels.iter().any(|c| c.token == "tok-0"));
    }

    #[tokio::test]
    async fn test_register_unknown_user_fails() {
        let (registry, _store) = setup();
        let err = registry
            .register(Uuid::new_v4(), "tok", DeviceInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_register_caps_at_five() {
        let (registry, store) = setup();
        let id = seeded_user(&store).await;

        for i in 0..6 {
            let count = registry
                .register(id, &format!("tok-{i}"), android())
                .await
                .unwrap();
            assert_eq!(count, (i + 1).min(MAX_CHANNELS_PER_USER));
        }

        let all = registry.list_all(id).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(!all.iter().any(|c| c.token == "tok-0"));
    }

    #[tokio::test]
    async fn test_register_same_token_is_idempotent_and_reactivates() {
        let (registry, store) = setup();
        let id = seeded_user(&store).await;

        registry.register(id, "tok", android()).await.unwrap();
        registry.record_outcome(id, "tok", false, true).await.unwrap();
        assert!(registry.list_active(id).await.unwrap().is_empty());
        let first_seen = registry.list_all(id).await.unwrap()[0].last_used_at;

        let ios = DeviceInfo {
            platform: Some("ios".to_string()),
            ..Default::default()
        };
        let count = registry.register(id, "tok", ios.clone()).await.unwrap();
        assert_eq!(count, 1);

        let active = registry.list_active(id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].deactivated_at.is_none());
        assert_eq!(active[0].device_info, ios);
        assert!(active[0].last_used_at >= first_seen);
    }

    #[tokio::test]
    async fn test_unregister() {
        let (registry, store) = setup();
        let id = seeded_user(&store).await;
        registry.register(id, "tok", android()).await.unwrap();

        assert!(registry.unregister(id, "tok").await.unwrap());
        assert!(!registry.unregister(id, "tok").await.unwrap());
        assert!(registry.list_all(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_deactivate_at_threshold() {
        let (registry, store) = setup();
        let id = seeded_user(&store).await;
        registry.register(id, "tok", android()).await.unwrap();

        for _ in 0..CHANNEL_ERROR_THRESHOLD - 1 {
            registry.record_outcome(id, "tok", false, false).await.unwrap();
        }
        assert_eq!(registry.list_active(id).await.unwrap().len(), 1);

        registry.record_outcome(id, "tok", false, false).await.unwrap();
        assert!(registry.list_active(id).await.unwrap().is_empty());

        let channel = &registry.list_all(id).await.unwrap()[0];
        assert_eq!(channel.error_count, CHANNEL_ERROR_THRESHOLD);
        assert!(channel.deactivated_at.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_error_count() {
        let (registry, store) = setup();
        let id = seeded_user(&store).await;
        registry.register(id, "tok", android()).await.unwrap();

        for _ in 0..3 {
            registry.record_outcome(id, "tok", false, false).await.unwrap();
        }
        registry.record_outcome(id, "tok", true, false).await.unwrap();

        let channel = &registry.list_active(id).await.unwrap()[0];
        assert_eq!(channel.error_count, 0);
        assert_eq!(channel.success_count, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_deactivates_immediately() {
        let (registry, store) = setup();
        let id = seeded_user(&store).await;
        registry.register(id, "tok", android()).await.unwrap();

        registry.record_outcome(id, "tok", false, true).await.unwrap();

        let channel = &registry.list_all(id).await.unwrap()[0];
        assert!(!channel.active);
        assert_eq!(channel.error_count, 0);
    }

    #[tokio::test]
    async fn test_list_active_orders_by_last_used_desc() {
        let (registry, store) = setup();
        let id = seeded_user(&store).await;
        registry.register(id, "a", android()).await.unwrap();
        registry.register(id, "b", android()).await.unwrap();
        registry.record_outcome(id, "a", true, false).await.unwrap();

        let active = registry.list_active(id).await.unwrap();
        assert_eq!(active[0].token, "a");
        assert_eq!(active[1].token, "b");
    }

    #[tokio::test]
    async fn test_outcome_for_unknown_token_ignored() {
        let (registry, store) = setup();
        let id = seeded_user(&store).await;
        registry.record_outcome(id, "ghost", true, false).await.unwrap();
        assert!(registry.list_all(id).await.unwrap().is_empty());
    }
}
