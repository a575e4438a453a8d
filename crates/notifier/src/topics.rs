//! Topic index: which users are subscribed to which broadcast topics.
//!
//! Membership is recorded on the user record first; the gateway is then asked
//! to (un)subscribe every active channel. A partial gateway failure is
//! reported back but never rolls the membership record back.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use nudge_common::error::NotifyError;
use nudge_common::types::Topic;
use nudge_engine::channels::ChannelRegistry;
use nudge_engine::locks::UserLocks;
use nudge_engine::store::UserStore;

use crate::gateway::{MembershipReport, PushGateway};

/// Outcome of a subscribe or unsubscribe call.
#[derive(Debug, Clone, Serialize)]
pub struct MembershipChange {
    pub user_id: Uuid,
    pub topic: Topic,
    /// False when the call was a no-op (already subscribed / not subscribed).
    pub changed: bool,
    pub channels: usize,
    pub gateway: MembershipReport,
}

impl MembershipChange {
    pub fn is_partial(&self) -> bool {
        self.gateway.failure_count > 0
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Subscribe,
    Unsubscribe,
}

pub struct TopicIndex {
    store: Arc<dyn UserStore>,
    locks: Arc<UserLocks>,
    gateway: Arc<dyn PushGateway>,
    call_timeout: Duration,
}

impl TopicIndex {
    pub fn new(
        store: Arc<dyn UserStore>,
        locks: Arc<UserLocks>,
        gateway: Arc<dyn PushGateway>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            gateway,
            call_timeout,
        }
    }

    pub async fn subscribe(
        &self,
        user_id: Uuid,
        topic: &str,
    ) -> Result<MembershipChange, NotifyError> {
        self.update_membership(user_id, topic, Direction::Subscribe)
            .await
    }

    pub async fn unsubscribe(
        &self,
        user_id: Uuid,
        topic: &str,
    ) -> Result<MembershipChange, NotifyError> {
        self.update_membership(user_id, topic, Direction::Unsubscribe)
            .await
    }

    pub async fn members_of(&self, topic: &str) -> Result<Vec<Uuid>, NotifyError> {
        let topic: Topic = topic.parse()?;
        self.store.find_by_topic(topic).await
    }

    pub async fn topics_of(&self, user_id: Uuid) -> Result<Vec<Topic>, NotifyError> {
        Ok(self.store.require(user_id).await?.topics)
    }

    async fn update_membership(
        &self,
        user_id: Uuid,
        topic: &str,
        direction: Direction,
    ) -> Result<MembershipChange, NotifyError> {
        let topic: Topic = topic.parse()?;

        // Record membership under the user lock; the gateway call happens after release.
        let (changed, tokens) = {
            let _guard = self.locks.lock(user_id).await;
            let mut user = self.store.require(user_id).await?;

            let subscribed = user.topics.contains(&topic);
            let changed = match direction {
                Direction::Subscribe if !subscribed => {
                    user.topics.push(topic);
                    true
                }
                Direction::Unsubscribe if subscribed => {
                    user.topics.retain(|t| *t != topic);
                    true
                }
                _ => false,
            };
            if changed {
                self.store.save(&user).await?;
            }

            let tokens: Vec<String> = ChannelRegistry::active_channels(&user)
                .into_iter()
                .map(|c| c.token)
                .collect();
            (changed, tokens)
        };

        let report = self.push_membership(&tokens, topic, direction).await;
        if report.failure_count > 0 {
            tracing::warn!(
                user_id = %user_id,
                topic = %topic,
                failed = report.failure_count,
                succeeded = report.success_count,
                "Topic membership only partially applied at gateway"
            );
        }

        tracing::info!(
            user_id = %user_id,
            topic = %topic,
            direction = ?direction,
            changed,
            "Topic membership updated"
        );

        Ok(MembershipChange {
            user_id,
            topic,
            changed,
            channels: tokens.len(),
            gateway: report,
        })
    }

    async fn push_membership(
        &self,
        tokens: &[String],
        topic: Topic,
        direction: Direction,
    ) -> MembershipReport {
        if tokens.is_empty() {
            return MembershipReport::default();
        }

        let call = async {
            match direction {
                Direction::Subscribe => self.gateway.subscribe_tokens(tokens, topic).await,
                Direction::Unsubscribe => self.gateway.unsubscribe_tokens(tokens, topic).await,
            }
        };

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                tracing::warn!(topic = %topic, error = %e, "Gateway topic membership call failed");
                MembershipReport {
                    success_count: 0,
                    failure_count: tokens.len(),
                }
            }
            Err(_) => {
                tracing::warn!(topic = %topic, "Gateway topic membership call timed out");
                MembershipReport {
                    success_count: 0,
                    failure_count: tokens.len(),
                }
            }
        }
    }
}
