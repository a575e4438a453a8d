//! Notification dispatcher.
//!
//! Sends a notification to:
//! 1. one user: every active channel in parallel, outcomes fed back into the
//!    channel registry, one history entry per send
//! 2. a list of users: fixed-size batches, concurrent within a batch,
//!    sequential across batches with a delay in between
//! 3. a topic: a single gateway broadcast; channels are not touched
//!
//! Per-channel and per-user failures are captured in the result, never
//! propagated. Without gateway credentials every operation short-circuits to a
//! result tagged `simulated`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use futures::StreamExt;
use serde::Serialize;
use uuid::Uuid;

use nudge_common::config::AppConfig;
use nudge_common::error::{GatewayError, NotifyError};
use nudge_common::types::{HistoryEntry, Notification, Target, Topic, token_prefix};
use nudge_engine::channels::{ChannelOutcome, ChannelRegistry};
use nudge_engine::history::HistoryLog;
use nudge_engine::store::UserStore;

use crate::gateway::{PushGateway, PushPayload};

/// Upper bound on the number of users in one bulk send.
pub const MAX_BULK_TARGETS: usize = 500;

/// Deployment-level dispatch settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Timeout for each individual gateway call
    pub call_timeout: Duration,
    /// Default users per batch for bulk sends
    pub batch_size: usize,
    /// Default pause between bulk batches
    pub batch_delay: Duration,
    /// Zone used to evaluate quiet hours
    pub timezone: Tz,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            batch_size: 100,
            batch_delay: Duration::from_millis(1000),
            timezone: chrono_tz::UTC,
        }
    }
}

impl DispatchConfig {
    pub fn from_app_config(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            call_timeout: config.gateway_timeout(),
            batch_size: config.bulk_batch_size,
            batch_delay: config.bulk_batch_delay(),
            timezone: config.timezone()?,
        })
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Overrides `DispatchConfig::batch_size`
    pub batch_size: Option<usize>,
    /// Overrides `DispatchConfig::batch_delay`
    pub batch_delay: Option<Duration>,
    /// Honor the user's enabled flag, type toggles and quiet hours
    pub respect_preferences: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            batch_delay: None,
            respect_preferences: true,
        }
    }
}

impl SendOptions {
    pub fn batched(batch_size: usize, batch_delay: Duration) -> Self {
        Self {
            batch_size: Some(batch_size),
            batch_delay: Some(batch_delay),
            ..Default::default()
        }
    }

    pub fn ignoring_preferences() -> Self {
        Self {
            respect_preferences: false,
            ..Default::default()
        }
    }
}

/// Outcome of one channel send.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelResult {
    pub token: String,
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub permanent: bool,
}

impl ChannelResult {
    fn delivered(token: &str, message_id: String) -> Self {
        Self {
            token: token.to_string(),
            success: true,
            message_id: Some(message_id),
            error: None,
            permanent: false,
        }
    }

    fn failed(token: &str, error: GatewayError) -> Self {
        Self {
            token: token.to_string(),
            success: false,
            message_id: None,
            permanent: error.is_permanent(),
            error: Some(error.to_string()),
        }
    }

    fn outcome(&self) -> ChannelOutcome {
        ChannelOutcome {
            token: self.token.clone(),
            success: self.success,
            permanent_failure: self.permanent,
        }
    }
}

/// Result of `send_to_user`.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub user_id: Uuid,
    pub success: bool,
    pub success_count: usize,
    pub total_channels: usize,
    pub results: Vec<ChannelResult>,
    pub simulated: bool,
}

impl DispatchResult {
    fn simulated(user_id: Uuid) -> Self {
        Self {
            user_id,
            success: true,
            success_count: 0,
            total_channels: 0,
            results: Vec::new(),
            simulated: true,
        }
    }
}

/// Per-user line of a bulk send.
#[derive(Debug, Clone, Serialize)]
pub struct UserDelivery {
    pub user_id: Uuid,
    pub success: bool,
    pub success_count: usize,
    pub error: Option<String>,
    /// Status a handler would answer with for this user's error
    pub error_status: Option<u16>,
}

/// Result of `send_to_users`.
#[derive(Debug, Clone, Serialize)]
pub struct BulkResult {
    pub total_users: usize,
    pub successful_users: usize,
    /// Sum of successful channel deliveries across all users
    pub total_notifications: usize,
    pub batches: usize,
    pub users: Vec<UserDelivery>,
    pub simulated: bool,
}

impl BulkResult {
    pub fn failures(&self) -> impl Iterator<Item = &UserDelivery> {
        self.users.iter().filter(|u| !u.success)
    }
}

/// Result of `send_to_topic`.
#[derive(Debug, Clone, Serialize)]
pub struct TopicResult {
    pub topic: Topic,
    pub success: bool,
    pub message_id: Option<String>,
    pub simulated: bool,
}

/// Result of `deliver`, by target kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryReport {
    User(DispatchResult),
    Users(BulkResult),
    Topic(TopicResult),
}

pub struct Dispatcher {
    gateway: Arc<dyn PushGateway>,
    store: Arc<dyn UserStore>,
    channels: Arc<ChannelRegistry>,
    history: Arc<HistoryLog>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        gateway: Arc<dyn PushGateway>,
        store: Arc<dyn UserStore>,
        channels: Arc<ChannelRegistry>,
        history: Arc<HistoryLog>,
        config: DispatchConfig,
    ) -> Self {
        if gateway.is_simulated() {
            tracing::warn!(
                "Dispatcher running in simulated mode, no notifications will be delivered"
            );
        }
        Self {
            gateway,
            store,
            channels,
            history,
            config,
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.gateway.is_simulated()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Send to every active channel of one user.
    pub async fn send_to_user(
        &self,
        user_id: Uuid,
        notification: &Notification,
        options: &SendOptions,
    ) -> Result<DispatchResult, NotifyError> {
        notification.validate()?;

        if self.gateway.is_simulated() {
            tracing::info!(
                user_id = %user_id,
                title = %notification.title,
                "[simulated] notification to user"
            );
            return Ok(DispatchResult::simulated(user_id));
        }

        let user = self.store.require(user_id).await?;

        if options.respect_preferences {
            let local_time = Utc::now().with_timezone(&self.config.timezone).time();
            if let Some(reason) = user.preferences.blocks(notification.kind, local_time) {
                tracing::debug!(user_id = %user_id, reason = %reason, "Notification suppressed");
                return Err(NotifyError::Suppressed { user_id, reason });
            }
        }

        let channels = ChannelRegistry::active_channels(&user);
        if channels.is_empty() {
            return Err(NotifyError::NoChannels(user_id));
        }

        let sent_at = Utc::now();
        let payload = PushPayload::render(notification, sent_at);

        let results: Vec<ChannelResult> = futures::future::join_all(
            channels
                .iter()
                .map(|channel| self.send_to_channel(&channel.token, &payload)),
        )
        .await;

        let outcomes: Vec<ChannelOutcome> = results.iter().map(ChannelResult::outcome).collect();
        self.channels.record_outcomes(user_id, &outcomes).await?;

        let success_count = results.iter().filter(|r| r.success).count();
        let total_channels = results.len();

        self.history
            .append(
                user_id,
                HistoryEntry {
                    title: notification.title.clone(),
                    body: notification.body.clone(),
                    kind: notification.kind,
                    sent_at,
                    success: success_count > 0,
                    channels_count: total_channels,
                    success_count,
                    data: notification.data.clone(),
                },
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            kind = %notification.kind,
            success_count,
            total_channels,
            "Notification sent to user"
        );

        Ok(DispatchResult {
            user_id,
            success: success_count > 0,
            success_count,
            total_channels,
            results,
            simulated: false,
        })
    }

    /// Send to many users in rate-limited batches.
    pub async fn send_to_users(
        &self,
        user_ids: &[Uuid],
        notification: &Notification,
        options: &SendOptions,
    ) -> Result<BulkResult, NotifyError> {
        if user_ids.is_empty() {
            return Err(NotifyError::EmptyTargets);
        }
        if user_ids.len() > MAX_BULK_TARGETS {
            return Err(NotifyError::TooManyTargets {
                count: user_ids.len(),
                max: MAX_BULK_TARGETS,
            });
        }
        notification.validate()?;

        let batch_size = options.batch_size.unwrap_or(self.config.batch_size).max(1);
        let batch_delay = options.batch_delay.unwrap_or(self.config.batch_delay);
        let batch_count = user_ids.len().div_ceil(batch_size);

        if self.gateway.is_simulated() {
            tracing::info!(
                users = user_ids.len(),
                title = %notification.title,
                "[simulated] bulk notification"
            );
            return Ok(BulkResult {
                total_users: user_ids.len(),
                successful_users: user_ids.len(),
                total_notifications: 0,
                batches: batch_count,
                users: user_ids
                    .iter()
                    .map(|&user_id| UserDelivery {
                        user_id,
                        success: true,
                        success_count: 0,
                        error: None,
                        error_status: None,
                    })
                    .collect(),
                simulated: true,
            });
        }

        let mut users = Vec::with_capacity(user_ids.len());

        for (index, batch) in user_ids.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(batch_delay).await;
            }

            let deliveries: Vec<UserDelivery> = futures::stream::iter(batch.iter().copied())
                .map(|user_id| async move {
                    match self.send_to_user(user_id, notification, options).await {
                        Ok(result) => UserDelivery {
                            user_id,
                            success: result.success,
                            success_count: result.success_count,
                            error: None,
                            error_status: None,
                        },
                        Err(e) => {
                            tracing::warn!(
                                user_id = %user_id,
                                error = %e,
                                "Bulk send to user failed"
                            );
                            UserDelivery {
                                user_id,
                                success: false,
                                success_count: 0,
                                error_status: Some(e.status_code()),
                                error: Some(e.to_string()),
                            }
                        }
                    }
                })
                .buffer_unordered(batch_size)
                .collect()
                .await;

            tracing::debug!(
                batch = index + 1,
                batches = batch_count,
                size = batch.len(),
                "Bulk batch complete"
            );
            users.extend(deliveries);
        }

        let successful_users = users.iter().filter(|u| u.success).count();
        let total_notifications = users.iter().map(|u| u.success_count).sum();

        tracing::info!(
            total_users = user_ids.len(),
            successful_users,
            total_notifications,
            batches = batch_count,
            "Bulk notification complete"
        );

        Ok(BulkResult {
            total_users: user_ids.len(),
            successful_users,
            total_notifications,
            batches: batch_count,
            users,
            simulated: false,
        })
    }

    /// Broadcast to a topic with a single gateway call.
    pub async fn send_to_topic(
        &self,
        topic: &str,
        notification: &Notification,
        _options: &SendOptions,
    ) -> Result<TopicResult, NotifyError> {
        let topic: Topic = topic.parse()?;
        notification.validate()?;

        if self.gateway.is_simulated() {
            tracing::info!(
                topic = %topic,
                title = %notification.title,
                "[simulated] topic broadcast"
            );
            return Ok(TopicResult {
                topic,
                success: true,
                message_id: None,
                simulated: true,
            });
        }

        let payload = PushPayload::render(notification, Utc::now());
        let message_id = tokio::time::timeout(
            self.config.call_timeout,
            self.gateway.send_to_topic(topic, &payload),
        )
        .await
        .map_err(|_| GatewayError::Timeout(self.config.call_timeout))??;

        tracing::info!(topic = %topic, message_id = %message_id, "Topic broadcast sent");

        Ok(TopicResult {
            topic,
            success: true,
            message_id: Some(message_id),
            simulated: false,
        })
    }

    /// Route a notification to whatever `target` names.
    pub async fn deliver(
        &self,
        target: &Target,
        notification: &Notification,
        options: &SendOptions,
    ) -> Result<DeliveryReport, NotifyError> {
        match target {
            Target::User(user_id) => self
                .send_to_user(*user_id, notification, options)
                .await
                .map(DeliveryReport::User),
            Target::Users(user_ids) => self
                .send_to_users(user_ids, notification, options)
                .await
                .map(DeliveryReport::Users),
            Target::Topic(topic) => self
                .send_to_topic(topic.as_str(), notification, options)
                .await
                .map(DeliveryReport::Topic),
        }
    }

    async fn send_to_channel(&self, token: &str, payload: &PushPayload) -> ChannelResult {
        let result = tokio::time::timeout(
            self.config.call_timeout,
            self.gateway.send_to_token(token, payload),
        )
        .await
        .unwrap_or(Err(GatewayError::Timeout(self.config.call_timeout)));

        match result {
            Ok(message_id) => ChannelResult::delivered(token, message_id),
            Err(e) => {
                tracing::debug!(
                    token = token_prefix(token),
                    permanent = e.is_permanent(),
                    error = %e,
                    "Channel send failed"
                );
                ChannelResult::failed(token, e)
            }
        }
    }
}
