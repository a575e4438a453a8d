//! Cron-driven job scheduler.
//!
//! A job is a record `{name, schedule, task_id}`; the task id resolves to a
//! registered function `(now) -> Option<(Notification, Target)>` whose output
//! is handed to the dispatcher. Jobs fire either from per-job timers owned by
//! the scheduler or from an external trigger calling [`Scheduler::tick`].
//!
//! Lifecycle:
//! - `Idle --start()--> Running --stop()--> Idle`
//! - `start()` while running and `stop()` while idle are logged no-ops
//! - `stop()` cancels and joins every timer before returning

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use nudge_common::error::NotifyError;
use nudge_common::types::{Notification, Target, Topic};
use nudge_notifier::dispatcher::{Dispatcher, SendOptions};

/// What a job wants sent when it fires.
#[derive(Debug, Clone)]
pub struct ScheduledDelivery {
    pub notification: Notification,
    pub target: Target,
}

impl ScheduledDelivery {
    pub fn to_topic(topic: Topic, notification: Notification) -> Self {
        Self {
            notification,
            target: Target::Topic(topic),
        }
    }
}

/// `Ok(None)` means "nothing to send this time".
pub type TaskResult = Result<Option<ScheduledDelivery>, NotifyError>;

pub type JobTask = Arc<dyn Fn(DateTime<Tz>) -> TaskResult + Send + Sync>;

/// Where firings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerSource {
    /// One timer task per job.
    #[default]
    Internal,
    /// No timers; the caller drives firings through `tick`.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledJob {
    pub name: String,
    pub schedule: String,
    pub task_id: String,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub job_count: usize,
    pub job_names: Vec<String>,
}

struct JobTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl JobTimer {
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await
            && !e.is_cancelled()
        {
            tracing::warn!(error = %e, "Job timer ended abnormally");
        }
    }
}

struct JobEntry {
    cron_expr: String,
    task_id: String,
    schedule: cron::Schedule,
    task: JobTask,
    timer: Option<JobTimer>,
}

#[derive(Default)]
struct SchedulerState {
    running: bool,
    jobs: BTreeMap<String, JobEntry>,
}

pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    timezone: Tz,
    trigger: TriggerSource,
    tasks: DashMap<String, JobTask>,
    state: Mutex<SchedulerState>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Schedules are evaluated in the dispatcher's configured timezone.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let timezone = dispatcher.config().timezone;
        Self {
            dispatcher,
            timezone,
            trigger: TriggerSource::default(),
            tasks: DashMap::new(),
            state: Mutex::new(SchedulerState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_trigger(mut self, trigger: TriggerSource) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Register (or replace) the function behind `task_id`.
    ///
    /// Jobs resolve their task when scheduled; re-registering does not
    /// affect jobs already installed.
    pub fn register_task<F>(&self, task_id: impl Into<String>, task: F)
    where
        F: Fn(DateTime<Tz>) -> TaskResult + Send + Sync + 'static,
    {
        let task_id = task_id.into();
        if self.tasks.insert(task_id.clone(), Arc::new(task)).is_some() {
            tracing::debug!(task = %task_id, "Replaced task registration");
        }
    }

    /// Install a job, replacing any job already registered under `name`.
    pub async fn schedule_job(
        &self,
        name: &str,
        cron_expr: &str,
        task_id: &str,
    ) -> Result<ScheduledJob, NotifyError> {
        let schedule = parse_cron(cron_expr)?;
        let task = self
            .tasks
            .get(task_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| NotifyError::NotFound(format!("task {}", task_id)))?;

        let mut state = self.state.lock().await;

        if let Some(previous) = state.jobs.remove(name) {
            if let Some(timer) = previous.timer {
                timer.shutdown().await;
            }
            tracing::info!(job = %name, previous = %previous.cron_expr, "Replacing existing job");
        }

        let timer = (state.running && self.trigger == TriggerSource::Internal)
            .then(|| self.spawn_timer(name, &schedule, task.clone()));

        state.jobs.insert(
            name.to_string(),
            JobEntry {
                cron_expr: cron_expr.trim().to_string(),
                task_id: task_id.to_string(),
                schedule,
                task,
                timer,
            },
        );

        tracing::info!(job = %name, schedule = %cron_expr, task = %task_id, "Job scheduled");

        Ok(ScheduledJob {
            name: name.to_string(),
            schedule: cron_expr.trim().to_string(),
            task_id: task_id.to_string(),
            running: state.running,
        })
    }

    /// Remove a job and release its timer.
    pub async fn unschedule(&self, name: &str) -> Result<(), NotifyError> {
        let entry = self
            .state
            .lock()
            .await
            .jobs
            .remove(name)
            .ok_or_else(|| NotifyError::NotFound(format!("job {}", name)))?;

        if let Some(timer) = entry.timer {
            timer.shutdown().await;
        }
        tracing::info!(job = %name, "Job removed");
        Ok(())
    }

    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if state.running {
            tracing::warn!("Scheduler already running");
            return;
        }
        state.running = true;

        if self.trigger == TriggerSource::Internal {
            for (name, entry) in state.jobs.iter_mut() {
                entry.timer = Some(self.spawn_timer(name, &entry.schedule, entry.task.clone()));
            }
        }

        tracing::info!(
            jobs = state.jobs.len(),
            timezone = %self.timezone,
            trigger = ?self.trigger,
            "Scheduler started"
        );
    }

    /// Stop all jobs. Returns once every timer has been released.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.running {
            tracing::warn!("Scheduler is not running");
            return;
        }
        state.running = false;

        let timers: Vec<JobTimer> = state
            .jobs
            .values_mut()
            .filter_map(|entry| entry.timer.take())
            .collect();
        futures::future::join_all(timers.into_iter().map(JobTimer::shutdown)).await;

        tracing::info!(jobs = state.jobs.len(), "Scheduler stopped");
    }

    pub async fn status(&self) -> SchedulerStatus {
        let state = self.state.lock().await;
        SchedulerStatus {
            running: state.running,
            job_count: state.jobs.len(),
            job_names: state.jobs.keys().cloned().collect(),
        }
    }

    pub async fn jobs(&self) -> Vec<ScheduledJob> {
        let state = self.state.lock().await;
        state
            .jobs
            .iter()
            .map(|(name, entry)| ScheduledJob {
                name: name.clone(),
                schedule: entry.cron_expr.clone(),
                task_id: entry.task_id.clone(),
                running: state.running,
            })
            .collect()
    }

    /// Fire every job whose schedule matches the minute containing `now`.
    ///
    /// Returns the number of dispatch calls made. Does nothing while stopped or
    /// when the scheduler owns its own timers.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        if self.trigger != TriggerSource::External {
            tracing::warn!("Tick ignored, scheduler is driven by its own timers");
            return 0;
        }
        let local = now.with_timezone(&self.timezone);

        let due: Vec<(String, JobTask)> = {
            let state = self.state.lock().await;
            if !state.running {
                tracing::debug!("Tick ignored, scheduler stopped");
                return 0;
            }
            state
                .jobs
                .iter()
                .filter(|(_, entry)| fires_within_minute(&entry.schedule, local))
                .map(|(name, entry)| (name.clone(), entry.task.clone()))
                .collect()
        };

        let fired = futures::future::join_all(
            due.iter()
                .map(|(name, task)| fire(name, task, &self.dispatcher, local)),
        )
        .await;

        fired.into_iter().filter(|dispatched| *dispatched).count()
    }

    fn spawn_timer(&self, name: &str, schedule: &cron::Schedule, task: JobTask) -> JobTimer {
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(run_timer(
            name.to_string(),
            schedule.clone(),
            self.timezone,
            task,
            self.dispatcher.clone(),
            cancel.clone(),
        ));
        JobTimer { cancel, handle }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Parse a cron expression.
///
/// Five-field expressions use standard cron semantics: an implied `0` seconds
/// field, and day-of-week numbered 0-7 with both 0 and 7 meaning Sunday.
/// Six/seven-field expressions pass through unchanged.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, NotifyError> {
    let expr = expr.trim();
    let invalid = |reason: String| {
        NotifyError::Schedule(format!("invalid cron expression '{}': {}", expr, reason))
    };

    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = if let [minute, hour, day, month, weekday] = fields.as_slice() {
        let weekday = shift_day_of_week(weekday).map_err(invalid)?;
        format!("0 {} {} {} {} {}", minute, hour, day, month, weekday)
    } else {
        expr.to_string()
    };

    cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

/// Renumber a standard day-of-week field (0-7, Sunday = 0 or 7) to the
/// `cron` crate's 1-7 with Sunday = 1. Named days and `*` are kept as-is.
fn shift_day_of_week(field: &str) -> Result<String, String> {
    field
        .split(',')
        .map(shift_day_item)
        .collect::<Result<Vec<_>, _>>()
        .map(|items| items.join(","))
}

fn shift_day_item(item: &str) -> Result<String, String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    if range == "*" || range.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(item.to_string());
    }

    let day = |value: &str| match value.parse::<u32>() {
        Ok(d) if d <= 7 => Ok(d),
        _ => Err(format!("day of week '{}' is not in 0-7", value)),
    };
    let suffix = step.map(|s| format!("/{}", s)).unwrap_or_default();

    let Some((start, end)) = range.split_once('-') else {
        return Ok(format!("{}{}", day(range)? % 7 + 1, suffix));
    };
    let (start, end) = (day(start)? % 7, day(end)?);

    match (start, end) {
        (0, 7) => Ok(format!("1-7{}", suffix)),
        // `n-7` ends on Sunday, which the crate numbers first.
        (start, 7) if step.is_none() => Ok(format!("{}-7,1", start + 1)),
        (_, 7) => Err(format!("stepped range '{}' ending on Sunday is not supported", item)),
        (start, end) => Ok(format!("{}-{}{}", start + 1, end + 1, suffix)),
    }
}

/// True if `schedule` has a firing inside the minute containing `at`.
pub fn fires_within_minute(schedule: &cron::Schedule, at: DateTime<Tz>) -> bool {
    let Some(minute_start) = at.with_second(0).and_then(|t| t.with_nanosecond(0)) else {
        return false;
    };

    schedule
        .after(&(minute_start - TimeDelta::seconds(1)))
        .next()
        .is_some_and(|next| next < minute_start + TimeDelta::minutes(1))
}

async fn run_timer(
    name: String,
    schedule: cron::Schedule,
    timezone: Tz,
    task: JobTask,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) {
    let mut after = Utc::now().with_timezone(&timezone);

    loop {
        let Some(next) = schedule.after(&after).next() else {
            tracing::info!(job = %name, "Schedule has no upcoming firings");
            return;
        };
        let wait = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        fire(&name, &task, &dispatcher, next).await;

        // Skip firings missed while dispatching.
        after = next.max(Utc::now().with_timezone(&timezone));
    }
}

/// Run a job's task and dispatch its output. Returns true if a dispatch was attempted.
async fn fire(job: &str, task: &JobTask, dispatcher: &Dispatcher, at: DateTime<Tz>) -> bool {
    let delivery = match task(at) {
        Ok(Some(delivery)) => delivery,
        Ok(None) => {
            tracing::debug!(job = %job, "Job had nothing to send");
            return false;
        }
        Err(e) => {
            tracing::error!(job = %job, error = %e, "Job task failed");
            return false;
        }
    };

    match dispatcher
        .deliver(&delivery.target, &delivery.notification, &SendOptions::default())
        .await
    {
        Ok(_) => tracing::info!(job = %job, title = %delivery.notification.title, "Job dispatched"),
        Err(e) => tracing::warn!(job = %job, error = %e, "Job dispatch failed"),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_five_field_expression() {
        let schedule = parse_cron("30 9 * * *").unwrap();
        let from = chrono_tz::UTC.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let next = schedule.after(&from).next().unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (9, 30, 0));
    }

    #[test]
    fn test_parse_six_field_passthrough() {
        assert!(parse_cron("*/10 * * * * *").is_ok());
        assert!(parse_cron("0 0 19 * * Sun").is_ok());
    }

    #[test]
    fn test_parse_malformed() {
        for expr in ["", "not a cron", "61 * * * *", "* * *"] {
            let err = parse_cron(expr).unwrap_err();
            assert!(matches!(err, NotifyError::Schedule(_)), "{expr:?}");
        }
    }

    fn fires_at(expr: &str, day: u32) -> bool {
        // June 2025: the 1st is a Sunday, the 6th a Friday, the 7th a Saturday.
        let schedule = parse_cron(expr).unwrap();
        let at = chrono_tz::UTC.with_ymd_and_hms(2025, 6, day, 9, 0, 0).unwrap();
        fires_within_minute(&schedule, at)
    }

    #[test]
    fn test_five_field_weekday_range() {
        assert!(fires_at("0 9 * * 1-5", 2));
        assert!(fires_at("0 9 * * 1-5", 6));
        assert!(!fires_at("0 9 * * 1-5", 1));
        assert!(!fires_at("0 9 * * 1-5", 7));
    }

    #[test]
    fn test_five_field_sunday_as_zero_or_seven() {
        for expr in ["0 9 * * 0", "0 9 * * 7", "0 9 * * Sun"] {
            assert!(fires_at(expr, 1), "{expr}");
            assert!(!fires_at(expr, 2), "{expr}");
        }
    }

    #[test]
    fn test_five_field_weekday_lists_and_wrapping_ranges() {
        assert!(fires_at("0 9 * * 0,6", 7));
        assert!(fires_at("0 9 * * 0,6", 1));
        assert!(!fires_at("0 9 * * 0,6", 6));

        assert!(fires_at("0 9 * * 5-7", 6));
        assert!(fires_at("0 9 * * 5-7", 1));
        assert!(!fires_at("0 9 * * 5-7", 2));

        assert!(fires_at("0 9 * * 0-6", 4));
        assert!(fires_at("0 9 * * Mon-Fri", 6));
    }

    #[test]
    fn test_five_field_weekday_out_of_range() {
        let err = parse_cron("0 9 * * 8").unwrap_err();
        assert!(matches!(err, NotifyError::Schedule(_)));
    }

    #[test]
    fn test_fires_within_minute() {
        let schedule = parse_cron("0 9 * * *").unwrap();
        let tz = chrono_tz::UTC;

        let at_nine = tz.with_ymd_and_hms(2025, 3, 1, 9, 0, 42).unwrap();
        assert!(fires_within_minute(&schedule, at_nine));

        let one_past = tz.with_ymd_and_hms(2025, 3, 1, 9, 1, 0).unwrap();
        assert!(!fires_within_minute(&schedule, one_past));

        let one_before = tz.with_ymd_and_hms(2025, 3, 1, 8, 59, 59).unwrap();
        assert!(!fires_within_minute(&schedule, one_before));
    }

    #[test]
    fn test_fires_within_minute_respects_timezone() {
        let schedule = parse_cron("0 9 * * *").unwrap();
        let kolkata = chrono_tz::Asia::Kolkata;

        // 03:30 UTC is 09:00 in Kolkata.
        let utc = Utc.with_ymd_and_hms(2025, 3, 1, 3, 30, 0).unwrap();
        assert!(fires_within_minute(&schedule, utc.with_timezone(&kolkata)));
        assert!(!fires_within_minute(&schedule, utc.with_timezone(&chrono_tz::UTC)));
    }
}
