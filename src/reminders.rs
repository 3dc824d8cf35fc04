//! Reminder scheduling.
//!
//! Each persisted reminder gets one detached tokio task keyed by its id in a
//! registry; re-registering the same id aborts the previous task, which makes
//! the startup replay idempotent. Jobs never block conversation handling and
//! carry only a bot handle and a pool clone.
//!
//! `xe_after` reminders are stored like the others but are not scheduled at
//! startup; they are armed as one-shots when a meal entry is confirmed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use sqlx::SqlitePool;
use teloxide::prelude::*;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bot::ui_builder;
use crate::db::{self, Reminder, ReminderKind};

/// Snooze delay applied by the notification's snooze button.
pub const SNOOZE_MINUTES: i64 = 10;

/// Parse "HH:MM" into hour and minute.
pub fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.trim().split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour < 24 && minute < 60 {
        Some((hour, minute))
    } else {
        None
    }
}

/// Time until the next occurrence of `hour:minute` after `now`. If the
/// moment already passed today, the next one is tomorrow.
pub fn until_next_daily(now: NaiveDateTime, hour: u32, minute: u32) -> Duration {
    let Some(today) = now.date().and_hms_opt(hour, minute, 0) else {
        // hour/minute out of range, callers validate via parse_hhmm
        return Duration::days(1);
    };

    if today > now {
        today - now
    } else {
        today + Duration::days(1) - now
    }
}

pub struct ReminderScheduler {
    bot: Bot,
    pool: SqlitePool,
    jobs: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl ReminderScheduler {
    pub fn new(bot: Bot, pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            bot,
            pool,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Replay all persisted reminders after a restart. Idempotent.
    pub async fn schedule_all(&self) -> Result<()> {
        let reminders = db::all_reminders(&self.pool).await?;
        let mut scheduled = 0;
        for reminder in &reminders {
            if self.schedule(reminder) {
                scheduled += 1;
            }
        }
        info!(total = reminders.len(), scheduled, "Reminder replay complete");
        Ok(())
    }

    /// Register the recurring job for a reminder. Returns `false` for
    /// reminders that only fire on demand (`xe_after`) or with no usable
    /// schedule field.
    pub fn schedule(&self, reminder: &Reminder) -> bool {
        if reminder.kind() == Some(ReminderKind::XeAfter) {
            return false;
        }

        let bot = self.bot.clone();
        let pool = self.pool.clone();
        let id = reminder.id;

        let handle = if let Some((hour, minute)) =
            reminder.time.as_deref().and_then(parse_hhmm)
        {
            tokio::spawn(async move {
                loop {
                    let wait = until_next_daily(chrono::Local::now().naive_local(), hour, minute);
                    tokio::time::sleep(wait.to_std().unwrap_or(StdDuration::from_secs(60))).await;
                    if !fire(&bot, &pool, id).await {
                        break;
                    }
                }
            })
        } else if let Some(hours) = reminder.interval_hours.filter(|h| *h > 0) {
            tokio::spawn(async move {
                let period = StdDuration::from_secs(hours as u64 * 3600);
                loop {
                    tokio::time::sleep(period).await;
                    if !fire(&bot, &pool, id).await {
                        break;
                    }
                }
            })
        } else {
            warn!(reminder_id = id, kind = %reminder.kind, "Reminder has no schedule");
            return false;
        };

        self.register(id, handle);
        true
    }

    fn register(&self, reminder_id: i64, handle: JoinHandle<()>) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(previous) = jobs.insert(reminder_id, handle) {
            previous.abort();
            info!(reminder_id, "Replaced existing reminder job");
        }
    }

    /// Cancel the running job, if any. The database row is untouched.
    pub fn cancel_job(&self, reminder_id: i64) {
        if let Some(handle) = self.jobs.lock().unwrap().remove(&reminder_id) {
            handle.abort();
        }
    }

    /// Delete the reminder and cancel its job.
    pub async fn remove(&self, reminder_id: i64) -> Result<bool> {
        self.cancel_job(reminder_id);
        db::delete_reminder(&self.pool, reminder_id).await
    }

    /// Arm every `xe_after` reminder of the user as a one-shot, called when
    /// a meal entry is confirmed.
    pub async fn arm_after_meal(&self, telegram_id: i64) -> Result<()> {
        let reminders =
            db::reminders_of_kind(&self.pool, telegram_id, ReminderKind::XeAfter).await?;

        for reminder in reminders {
            let Some(minutes) = reminder.minutes_after.filter(|m| *m > 0) else {
                continue;
            };
            let bot = self.bot.clone();
            let pool = self.pool.clone();
            let id = reminder.id;
            info!(user_id = telegram_id, reminder_id = id, minutes, "After-meal check armed");
            tokio::spawn(async move {
                tokio::time::sleep(StdDuration::from_secs(minutes as u64 * 60)).await;
                fire(&bot, &pool, id).await;
            });
        }
        Ok(())
    }

    /// Log the snooze and fire the same reminder once, ten minutes out.
    pub async fn snooze(&self, reminder_id: i64, telegram_id: i64) -> Result<()> {
        db::log_reminder_action(&self.pool, reminder_id, telegram_id, "snooze").await?;

        let bot = self.bot.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_secs(SNOOZE_MINUTES as u64 * 60)).await;
            fire(&bot, &pool, reminder_id).await;
        });
        info!(user_id = telegram_id, reminder_id, "Reminder snoozed");
        Ok(())
    }
}

/// Deliver one notification. Re-reads the reminder so a deletion between
/// scheduling and firing silences the job; returns `false` when the reminder
/// is gone and the job loop should stop.
async fn fire(bot: &Bot, pool: &SqlitePool, reminder_id: i64) -> bool {
    let reminder = match db::get_reminder(pool, reminder_id).await {
        Ok(Some(reminder)) => reminder,
        Ok(None) => {
            info!(reminder_id, "Reminder deleted, job stops");
            return false;
        }
        Err(e) => {
            error!(reminder_id, error = %e, "Failed to read reminder before firing");
            return true;
        }
    };

    if let Err(e) =
        db::log_reminder_action(pool, reminder.id, reminder.telegram_id, "trigger").await
    {
        error!(reminder_id, error = %e, "Failed to log reminder trigger");
    }

    let text = format!("⏰ Напоминание: {}", reminder.describe());
    if let Err(e) = bot
        .send_message(ChatId(reminder.telegram_id), text)
        .reply_markup(ui_builder::reminder_trigger_keyboard(reminder.id))
        .await
    {
        error!(user_id = reminder.telegram_id, reminder_id, error = %e, "Failed to send reminder");
    }
    true
}
