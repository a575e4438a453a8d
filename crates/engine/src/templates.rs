//! Static catalog of notification templates.
//!
//! Callers pick a template by name and may override the title, body, image or
//! add data keys; overrides always win over the template defaults.

use std::collections::BTreeMap;

use nudge_common::error::NotifyError;
use nudge_common::types::{Notification, NotificationType};

/// Default content for a named template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    pub name: &'static str,
    pub title: &'static str,
    pub body: &'static str,
    pub kind: NotificationType,
}

/// Caller-supplied values merged over a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateOverrides {
    pub title: Option<String>,
    pub body: Option<String>,
    pub image_url: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl TemplateOverrides {
    pub fn body(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

const CATALOG: &[Template] = &[
    Template {
        name: "welcome",
        title: "Welcome aboard! 🎉",
        body: "Your health journey starts today. Log your first meal to get personalised tips.",
        kind: NotificationType::Welcome,
    },
    Template {
        name: "meal_reminder",
        title: "Time to log your meal 🍽️",
        body: "Keep your streak going by logging what you ate.",
        kind: NotificationType::Reminder,
    },
    Template {
        name: "water_reminder",
        title: "Hydration check 💧",
        body: "Have a glass of water and log it to stay on track.",
        kind: NotificationType::Reminder,
    },
    Template {
        name: "workout_reminder",
        title: "Time to move 🏃",
        body: "A short workout today keeps you on track for your weekly goal.",
        kind: NotificationType::Reminder,
    },
    Template {
        name: "daily_tip",
        title: "Today's health tip",
        body: "Small, consistent habits beat big occasional efforts.",
        kind: NotificationType::General,
    },
    Template {
        name: "weekly_progress",
        title: "Your weekly progress is ready 📊",
        body: "See how your week went and set a goal for the next one.",
        kind: NotificationType::Reminder,
    },
    Template {
        name: "achievement_unlocked",
        title: "Achievement unlocked! 🏆",
        body: "You reached a new milestone. Keep it up!",
        kind: NotificationType::Achievement,
    },
    Template {
        name: "subscription_upgrade",
        title: "Welcome to Premium ⭐",
        body: "Your premium features are now unlocked.",
        kind: NotificationType::Premium,
    },
    Template {
        name: "health_alert",
        title: "Health alert ⚠️",
        body: "One of your health metrics needs attention.",
        kind: NotificationType::HealthAlert,
    },
];

/// Read-only template catalog.
pub struct NotificationTemplates;

impl NotificationTemplates {
    pub fn get(name: &str) -> Option<&'static Template> {
        CATALOG.iter().find(|t| t.name == name)
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        CATALOG.iter().map(|t| t.name)
    }

    /// Build a notification from a template, applying caller overrides.
    pub fn render(name: &str, overrides: TemplateOverrides) -> Result<Notification, NotifyError> {
        let template =
            Self::get(name).ok_or_else(|| NotifyError::UnknownTemplate(name.to_string()))?;

        let mut data = overrides.data;
        data.entry("template".to_string())
            .or_insert_with(|| template.name.to_string());

        Ok(Notification {
            title: overrides.title.unwrap_or_else(|| template.title.to_string()),
            body: overrides.body.unwrap_or_else(|| template.body.to_string()),
            kind: template.kind,
            image_url: overrides.image_url,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_defaults() {
        let n = NotificationTemplates::render("welcome", TemplateOverrides::default()).unwrap();
        assert_eq!(n.title, "Welcome aboard! 🎉");
        assert_eq!(n.kind, NotificationType::Welcome);
        assert_eq!(n.data.get("template").map(String::as_str), Some("welcome"));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let overrides = TemplateOverrides::body("Custom body")
            .with_title("Custom title")
            .with_data("template", "mine")
            .with_data("screen", "progress");
        let n = NotificationTemplates::render("weekly_progress", overrides).unwrap();
        assert_eq!(n.title, "Custom title");
        assert_eq!(n.body, "Custom body");
        assert_eq!(n.data.get("template").map(String::as_str), Some("mine"));
        assert_eq!(n.data.get("screen").map(String::as_str), Some("progress"));
    }

    #[test]
    fn test_unknown_template() {
        let err = NotificationTemplates::render("nope", TemplateOverrides::default()).unwrap_err();
        assert!(matches!(err, NotifyError::UnknownTemplate(name) if name == "nope"));
    }

    #[test]
    fn test_catalog_names_unique() {
        let mut names: Vec<_> = NotificationTemplates::names().collect();
        let count = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), count);
    }
}
