//! Immediate sends for business events (signup, achievements, upgrades, alerts).
//!
//! These bypass the cron timers and dispatch to a single user right away.

use uuid::Uuid;

use nudge_common::error::NotifyError;
use nudge_engine::templates::{NotificationTemplates, TemplateOverrides};
use nudge_notifier::dispatcher::{DispatchResult, SendOptions};

use crate::scheduler::Scheduler;

impl Scheduler {
    pub async fn send_welcome(
        &self,
        user_id: Uuid,
        display_name: Option<&str>,
    ) -> Result<DispatchResult, NotifyError> {
        let mut overrides = TemplateOverrides::default();
        if let Some(name) = display_name.filter(|n| !n.trim().is_empty()) {
            overrides = overrides.with_title(format!("Welcome aboard, {}! 🎉", name.trim()));
        }
        self.send_template(user_id, "welcome", overrides).await
    }

    pub async fn send_achievement_unlocked(
        &self,
        user_id: Uuid,
        achievement: &str,
    ) -> Result<DispatchResult, NotifyError> {
        let overrides = TemplateOverrides::body(format!(
            "You unlocked \"{}\". Keep up the great work!",
            achievement
        ))
        .with_data("achievement", achievement);
        self.send_template(user_id, "achievement_unlocked", overrides)
            .await
    }

    pub async fn send_subscription_upgrade(
        &self,
        user_id: Uuid,
        plan: &str,
    ) -> Result<DispatchResult, NotifyError> {
        let overrides = TemplateOverrides::body(format!(
            "Your {} plan is active. All premium features are now unlocked.",
            plan
        ))
        .with_data("plan", plan);
        self.send_template(user_id, "subscription_upgrade", overrides)
            .await
    }

    /// Health alerts still respect a global opt-out but ignore quiet hours.
    pub async fn send_health_alert(
        &self,
        user_id: Uuid,
        metric: &str,
        message: &str,
    ) -> Result<DispatchResult, NotifyError> {
        let overrides = TemplateOverrides::body(message).with_data("metric", metric);
        self.send_template(user_id, "health_alert", overrides).await
    }

    async fn send_template(
        &self,
        user_id: Uuid,
        template: &str,
        overrides: TemplateOverrides,
    ) -> Result<DispatchResult, NotifyError> {
        let notification = NotificationTemplates::render(template, overrides)?;
        tracing::info!(user_id = %user_id, template = %template, "Immediate send");
        self.dispatcher()
            .send_to_user(user_id, &notification, &SendOptions::default())
            .await
    }
}
