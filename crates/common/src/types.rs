use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NotifyError;

/// Maximum number of device channels retained per user.
pub const MAX_CHANNELS_PER_USER: usize = 5;

/// Consecutive transient failures after which a channel is deactivated.
pub const CHANNEL_ERROR_THRESHOLD: u32 = 5;

/// Maximum number of history entries retained per user.
pub const MAX_HISTORY_ENTRIES: usize = 100;

/// Notification category, passed through to the client as `data.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Welcome,
    Reminder,
    Achievement,
    HealthAlert,
    Premium,
    General,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::Welcome => write!(f, "welcome"),
            NotificationType::Reminder => write!(f, "reminder"),
            NotificationType::Achievement => write!(f, "achievement"),
            NotificationType::HealthAlert => write!(f, "health_alert"),
            NotificationType::Premium => write!(f, "premium"),
            NotificationType::General => write!(f, "general"),
        }
    }
}

/// Broadcast topics a user can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    HealthTips,
    DailyReminders,
    Challenges,
    PremiumOffers,
    AppUpdates,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::HealthTips,
        Topic::DailyReminders,
        Topic::Challenges,
        Topic::PremiumOffers,
        Topic::AppUpdates,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::HealthTips => "health_tips",
            Topic::DailyReminders => "daily_reminders",
            Topic::Challenges => "challenges",
            Topic::PremiumOffers => "premium_offers",
            Topic::AppUpdates => "app_updates",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| NotifyError::InvalidTopic(s.to_string()))
    }
}

/// Free-form metadata describing the device behind a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// e.g. "ios", "android", "web"
    pub platform: Option<String>,
    /// e.g. "phone", "tablet"
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// One registered delivery endpoint (push token) for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub token: String,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub success_count: u64,
    pub error_count: u32,
    pub device_info: DeviceInfo,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Channel {
    pub fn new(token: impl Into<String>, device_info: DeviceInfo, now: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            active: true,
            registered_at: now,
            last_used_at: now,
            success_count: 0,
            error_count: 0,
            device_info,
            deactivated_at: None,
        }
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.active = false;
        self.deactivated_at = Some(now);
    }
}

/// Notification payload. Not persisted as an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub image_url: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>, kind: NotificationType) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            kind,
            image_url: None,
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Reject payloads missing required fields.
    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.title.trim().is_empty() {
            return Err(NotifyError::Validation(
                "notification title is required".to_string(),
            ));
        }
        if self.body.trim().is_empty() {
            return Err(NotifyError::Validation(
                "notification body is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// One record of an attempted delivery to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub sent_at: DateTime<Utc>,
    /// True if at least one channel accepted the notification.
    pub success: bool,
    pub channels_count: usize,
    pub success_count: usize,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Daily window during which non-critical notifications are held back.
///
/// `start > end` means the window wraps midnight (e.g. 22:00–07:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Per-user notification preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub enabled: bool,
    /// Per-type toggles. Types absent from the map are enabled.
    #[serde(default)]
    pub types: BTreeMap<NotificationType, bool>,
    pub quiet_hours: Option<QuietHours>,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            types: BTreeMap::new(),
            quiet_hours: None,
        }
    }
}

impl NotificationPreferences {
    /// Check whether a notification of `kind` may be delivered at `local_time`.
    ///
    /// Returns the reason it is blocked, if any. Health alerts ignore quiet hours.
    pub fn blocks(&self, kind: NotificationType, local_time: NaiveTime) -> Option<String> {
        if !self.enabled {
            return Some("notifications disabled".to_string());
        }
        if !self.types.get(&kind).copied().unwrap_or(true) {
            return Some(format!("{} notifications disabled", kind));
        }
        if kind != NotificationType::HealthAlert
            && let Some(quiet) = self.quiet_hours
            && quiet.contains(local_time)
        {
            return Some(format!(
                "quiet hours {}-{}",
                quiet.start.format("%H:%M"),
                quiet.end.format("%H:%M")
            ));
        }
        None
    }
}

/// The slice of the user record this subsystem reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub display_name: Option<String>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub topics: Vec<Topic>,
    /// Most recent first.
    #[serde(default)]
    pub history: VecDeque<HistoryEntry>,
    #[serde(default)]
    pub preferences: NotificationPreferences,
}

impl User {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            display_name: None,
            channels: Vec::new(),
            topics: Vec::new(),
            history: VecDeque::new(),
            preferences: NotificationPreferences::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Target {
    User(Uuid),
    Users(Vec<Uuid>),
    Topic(Topic),
}

/// Shorten a push token for logging.
pub fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}
