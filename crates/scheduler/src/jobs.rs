//! Built-in recurring reminder jobs.
//!
//! | job | schedule | topic |
//! |---|---|---|
//! | `daily_health_tip` | 09:00 daily | `health_tips` |
//! | `water_reminder` | 10:00, 14:00, 18:00 | `daily_reminders` |
//! | `meal_reminder` | 08:00, 13:00, 19:00 | `daily_reminders` |
//! | `weekly_progress` | Sunday 19:00 | `daily_reminders` |

use chrono::{DateTime, Datelike, Timelike};
use chrono_tz::Tz;

use nudge_common::error::NotifyError;
use nudge_common::types::Topic;
use nudge_engine::templates::{NotificationTemplates, TemplateOverrides};

use crate::scheduler::{ScheduledDelivery, Scheduler, TaskResult};

const HEALTH_TIPS: &[&str] = &[
    "Drinking a glass of water before each meal helps with portion control.",
    "Aim for at least 7 hours of sleep; recovery drives progress.",
    "Add one extra serving of vegetables to your lunch today.",
    "A 10-minute walk after meals helps keep blood sugar steady.",
    "Protein at breakfast keeps you fuller for longer.",
    "Take a short stretch break every hour you sit.",
    "Swap one sugary drink for water or unsweetened tea today.",
];

/// `(job name, cron expression, task)` for every built-in job.
pub const DEFAULT_JOBS: &[(&str, &str, fn(DateTime<Tz>) -> TaskResult)] = &[
    ("daily_health_tip", "0 9 * * *", daily_health_tip),
    ("water_reminder", "0 10,14,18 * * *", water_reminder),
    ("meal_reminder", "0 8,13,19 * * *", meal_reminder),
    ("weekly_progress", "0 19 * * Sun", weekly_progress),
];

/// Register and schedule every built-in job. Each job's task id is its name.
pub async fn register_default_jobs(scheduler: &Scheduler) -> Result<(), NotifyError> {
    for &(name, cron_expr, task) in DEFAULT_JOBS {
        scheduler.register_task(name, task);
        scheduler.schedule_job(name, cron_expr, name).await?;
    }
    tracing::info!(jobs = DEFAULT_JOBS.len(), "Default jobs registered");
    Ok(())
}

pub fn daily_health_tip(now: DateTime<Tz>) -> TaskResult {
    let tip = HEALTH_TIPS[now.ordinal0() as usize % HEALTH_TIPS.len()];
    let notification = NotificationTemplates::render("daily_tip", TemplateOverrides::body(tip))?;
    Ok(Some(ScheduledDelivery::to_topic(Topic::HealthTips, notification)))
}

pub fn water_reminder(_now: DateTime<Tz>) -> TaskResult {
    let notification =
        NotificationTemplates::render("water_reminder", TemplateOverrides::default())?;
    Ok(Some(ScheduledDelivery::to_topic(Topic::DailyReminders, notification)))
}

pub fn meal_reminder(now: DateTime<Tz>) -> TaskResult {
    let meal = meal_for_hour(now.hour());
    let overrides = TemplateOverrides::default()
        .with_title(format!("Time to log your {} 🍽️", meal))
        .with_data("meal", meal);
    let notification = NotificationTemplates::render("meal_reminder", overrides)?;
    Ok(Some(ScheduledDelivery::to_topic(Topic::DailyReminders, notification)))
}

pub fn weekly_progress(_now: DateTime<Tz>) -> TaskResult {
    let notification =
        NotificationTemplates::render("weekly_progress", TemplateOverrides::default())?;
    Ok(Some(ScheduledDelivery::to_topic(Topic::DailyReminders, notification)))
}

fn meal_for_hour(hour: u32) -> &'static str {
    match hour {
        5..=10 => "breakfast",
        11..=15 => "lunch",
        17..=22 => "dinner",
        _ => "snack",
    }
}
