//! Notification preferences: read and partial update.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use nudge_common::error::NotifyError;
use nudge_common::types::{NotificationPreferences, NotificationType, QuietHours};

use crate::locks::UserLocks;
use crate::store::UserStore;

/// Partial update. Omitted fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreferencesUpdate {
    pub enabled: Option<bool>,
    #[serde(default)]
    pub types: BTreeMap<NotificationType, bool>,
    /// `Some(None)` clears the quiet-hours window.
    #[serde(default, deserialize_with = "serde_with_option::deserialize")]
    pub quiet_hours: Option<Option<QuietHours>>,
}

// Distinguishes an absent `quiet_hours` key from an explicit `null`.
mod serde_with_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

pub struct PreferencesService {
    store: Arc<dyn UserStore>,
    locks: Arc<UserLocks>,
}

impl PreferencesService {
    pub fn new(store: Arc<dyn UserStore>, locks: Arc<UserLocks>) -> Self {
        Self { store, locks }
    }

    pub async fn get(&self, user_id: Uuid) -> Result<NotificationPreferences, NotifyError> {
        Ok(self.store.require(user_id).await?.preferences)
    }

    pub async fn update(
        &self,
        user_id: Uuid,
        update: PreferencesUpdate,
    ) -> Result<NotificationPreferences, NotifyError> {
        let _guard = self.locks.lock(user_id).await;
        let mut user = self.store.require(user_id).await?;

        let prefs = &mut user.preferences;
        if let Some(enabled) = update.enabled {
            prefs.enabled = enabled;
        }
        prefs.types.extend(update.types);
        if let Some(quiet_hours) = update.quiet_hours {
            prefs.quiet_hours = quiet_hours;
        }

        self.store.save(&user).await?;
        tracing::info!(
            user_id = %user_id,
            enabled = user.preferences.enabled,
            "Preferences updated"
        );

        Ok(user.preferences)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryUserStore;
    use chrono::NaiveTime;
    use nudge_common::types::User;

    async fn setup() -> (PreferencesService, Uuid) {
        let store = Arc::new(InMemoryUserStore::new());
        let id = Uuid::new_v4();
        store.insert(User::new(id)).await;
        (PreferencesService::new(store, Arc::new(UserLocks::new())), id)
    }

    #[tokio::test]
    async fn test_partial_update() {
        let (service, id) = setup().await;
        let quiet = QuietHours {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        };

        let mut update = PreferencesUpdate {
            quiet_hours: Some(Some(quiet)),
            ..Default::default()
        };
        update.types.insert(NotificationType::Premium, false);
        let prefs = service.update(id, update).await.unwrap();

        assert!(prefs.enabled);
        assert_eq!(prefs.types.get(&NotificationType::Premium), Some(&false));
        assert_eq!(prefs.quiet_hours, Some(quiet));

        let cleared = service
            .update(
                id,
                PreferencesUpdate {
                    quiet_hours: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cleared.quiet_hours.is_none());
        assert_eq!(cleared.types.get(&NotificationType::Premium), Some(&false));
    }

    #[test]
    fn test_update_json_absent_vs_null() {
        let absent: PreferencesUpdate = serde_json::from_str(r#"{"enabled": false}"#).unwrap();
        assert_eq!(absent.enabled, Some(false));
        assert!(absent.quiet_hours.is_none());

        let null: PreferencesUpdate = serde_json::from_str(r#"{"quiet_hours": null}"#).unwrap();
        assert_eq!(null.quiet_hours, Some(None));
    }
}
