//! SQLite persistence layer: users, profiles, diary entries, reminders and
//! the append-only reminder log.
//!
//! Every operation runs as its own short-lived statement or transaction; no
//! locks are held across await points outside a single call.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

use crate::nutrition::FieldUpdates;

/// Default pool size for the on-disk database.
const DEFAULT_POOL_SIZE: u32 = 5;

/// Active reminders allowed per user.
pub const MAX_REMINDERS: i64 = 5;

/// Connect to a SQLite database, creating the file if missing.
///
/// Use `connect_with_pool_size(url, 1)` with `sqlite::memory:` in tests so
/// every statement sees the same in-memory database.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    connect_with_pool_size(url, DEFAULT_POOL_SIZE).await
}

pub async fn connect_with_pool_size(url: &str, pool_size: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .context("Invalid database URL")?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(pool_size)
        .connect_with(options)
        .await
        .context("Failed to connect to database")?;

    info!(url = %url, pool_size, "Connected to database");
    Ok(pool)
}

/// Initialize the database schema.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    info!("Initializing database schema...");

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            telegram_id INTEGER PRIMARY KEY,
            thread_id TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create users table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS profiles (
            telegram_id INTEGER PRIMARY KEY,
            icr REAL,
            cf REAL,
            target_bg REAL
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create profiles table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            telegram_id INTEGER NOT NULL,
            event_time DATETIME NOT NULL,
            photo_path TEXT,
            carbs_g REAL,
            xe REAL,
            sugar_before REAL,
            dose REAL
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create entries table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS reminders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            telegram_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            time TEXT,
            interval_hours INTEGER,
            minutes_after INTEGER
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create reminders table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS reminder_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            reminder_id INTEGER NOT NULL,
            telegram_id INTEGER NOT NULL,
            action TEXT NOT NULL,
            at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create reminder_logs table")?;

    info!("Database schema initialized successfully");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct User {
    pub telegram_id: i64,
    pub thread_id: Option<String>,
}

/// Create the user on first contact; subsequent calls return the stored row.
pub async fn get_or_create_user(pool: &SqlitePool, telegram_id: i64) -> Result<User> {
    sqlx::query("INSERT OR IGNORE INTO users (telegram_id) VALUES (?)")
        .bind(telegram_id)
        .execute(pool)
        .await
        .context("Failed to insert user")?;

    let user = sqlx::query_as::<_, User>(
        "SELECT telegram_id, thread_id FROM users WHERE telegram_id = ?",
    )
    .bind(telegram_id)
    .fetch_one(pool)
    .await
    .context("Failed to read user")?;

    Ok(user)
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Profile {
    pub telegram_id: i64,
    pub icr: Option<f64>,
    pub cf: Option<f64>,
    pub target_bg: Option<f64>,
}

impl Profile {
    /// All three coefficients when the profile is ready for dose calculation.
    pub fn complete(&self) -> Option<(f64, f64, f64)> {
        match (self.icr, self.cf, self.target_bg) {
            (Some(icr), Some(cf), Some(target)) => Some((icr, cf, target)),
            _ => None,
        }
    }
}

/// Upsert the full profile for a user.
pub async fn save_profile(
    pool: &SqlitePool,
    telegram_id: i64,
    icr: f64,
    cf: f64,
    target_bg: f64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO profiles (telegram_id, icr, cf, target_bg)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(telegram_id) DO UPDATE SET
             icr = excluded.icr,
             cf = excluded.cf,
             target_bg = excluded.target_bg",
    )
    .bind(telegram_id)
    .bind(icr)
    .bind(cf)
    .bind(target_bg)
    .execute(pool)
    .await
    .context("Failed to save profile")?;

    info!(user_id = telegram_id, "Profile saved");
    Ok(())
}

/// Update only the profile fields that are present, creating the row if needed.
pub async fn update_profile_fields(
    pool: &SqlitePool,
    telegram_id: i64,
    icr: Option<f64>,
    cf: Option<f64>,
    target_bg: Option<f64>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO profiles (telegram_id, icr, cf, target_bg)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(telegram_id) DO UPDATE SET
             icr = COALESCE(excluded.icr, icr),
             cf = COALESCE(excluded.cf, cf),
             target_bg = COALESCE(excluded.target_bg, target_bg)",
    )
    .bind(telegram_id)
    .bind(icr)
    .bind(cf)
    .bind(target_bg)
    .execute(pool)
    .await
    .context("Failed to update profile")?;

    Ok(())
}

pub async fn get_profile(pool: &SqlitePool, telegram_id: i64) -> Result<Option<Profile>> {
    let profile = sqlx::query_as::<_, Profile>(
        "SELECT telegram_id, icr, cf, target_bg FROM profiles WHERE telegram_id = ?",
    )
    .bind(telegram_id)
    .fetch_optional(pool)
    .await
    .context("Failed to read profile")?;

    Ok(profile)
}

/// A confirmed diary record.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Entry {
    pub id: i64,
    pub telegram_id: i64,
    pub event_time: DateTime<Utc>,
    pub photo_path: Option<String>,
    pub carbs_g: Option<f64>,
    pub xe: Option<f64>,
    pub sugar_before: Option<f64>,
    pub dose: Option<f64>,
}

/// An entry that has not been persisted yet: same shape as [`Entry`] minus
/// the id. Also serves as the staged draft held per chat.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub telegram_id: i64,
    pub event_time: DateTime<Utc>,
    pub photo_path: Option<String>,
    pub carbs_g: Option<f64>,
    pub xe: Option<f64>,
    pub sugar_before: Option<f64>,
    pub dose: Option<f64>,
}

impl NewEntry {
    pub fn new(telegram_id: i64) -> Self {
        Self {
            telegram_id,
            event_time: Utc::now(),
            photo_path: None,
            carbs_g: None,
            xe: None,
            sugar_before: None,
            dose: None,
        }
    }

    /// Whether this record represents a meal (arms `xe_after` reminders).
    pub fn implies_meal(&self) -> bool {
        self.carbs_g.is_some() || self.xe.is_some()
    }

    /// Apply `key=value` edits; fields not mentioned are unchanged.
    pub fn apply(&mut self, updates: &FieldUpdates) {
        if let Some(sugar) = updates.sugar_before {
            self.sugar_before = Some(sugar);
        }
        if let Some(xe) = updates.xe {
            self.xe = Some(xe);
        }
        if let Some(carbs) = updates.carbs_g {
            self.carbs_g = Some(carbs);
        }
        if let Some(dose) = updates.dose {
            self.dose = Some(dose);
        }
    }
}

/// Insert an entry through any executor (pool or open transaction).
pub async fn insert_entry<'e, E>(executor: E, entry: &NewEntry) -> Result<i64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        "INSERT INTO entries (telegram_id, event_time, photo_path, carbs_g, xe, sugar_before, dose)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.telegram_id)
    .bind(entry.event_time)
    .bind(&entry.photo_path)
    .bind(entry.carbs_g)
    .bind(entry.xe)
    .bind(entry.sugar_before)
    .bind(entry.dose)
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn get_entry(pool: &SqlitePool, entry_id: i64) -> Result<Option<Entry>> {
    let entry = sqlx::query_as::<_, Entry>(
        "SELECT id, telegram_id, event_time, photo_path, carbs_g, xe, sugar_before, dose
         FROM entries WHERE id = ?",
    )
    .bind(entry_id)
    .fetch_optional(pool)
    .await
    .context("Failed to read entry")?;

    Ok(entry)
}

/// Update only the fields present in `updates`. Returns `false` when no
/// entry with that id exists.
pub async fn update_entry_fields(
    pool: &SqlitePool,
    entry_id: i64,
    updates: &FieldUpdates,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE entries SET
             sugar_before = COALESCE(?, sugar_before),
             xe = COALESCE(?, xe),
             carbs_g = COALESCE(?, carbs_g),
             dose = COALESCE(?, dose)
         WHERE id = ?",
    )
    .bind(updates.sugar_before)
    .bind(updates.xe)
    .bind(updates.carbs_g)
    .bind(updates.dose)
    .bind(entry_id)
    .execute(pool)
    .await
    .context("Failed to update entry")?;

    Ok(result.rows_affected() > 0)
}

pub async fn delete_entry(pool: &SqlitePool, entry_id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM entries WHERE id = ?")
        .bind(entry_id)
        .execute(pool)
        .await
        .context("Failed to delete entry")?;

    Ok(result.rows_affected() > 0)
}

/// Entries of a user since `date_from`, ascending by event time.
pub async fn get_entries_since(
    pool: &SqlitePool,
    telegram_id: i64,
    date_from: DateTime<Utc>,
) -> Result<Vec<Entry>> {
    let entries = sqlx::query_as::<_, Entry>(
        "SELECT id, telegram_id, event_time, photo_path, carbs_g, xe, sugar_before, dose
         FROM entries
         WHERE telegram_id = ? AND event_time >= ?
         ORDER BY event_time",
    )
    .bind(telegram_id)
    .bind(date_from)
    .fetch_all(pool)
    .await
    .context("Failed to read entries")?;

    Ok(entries)
}

/// Most recent entries of a user, newest first.
pub async fn recent_entries(pool: &SqlitePool, telegram_id: i64, limit: i64) -> Result<Vec<Entry>> {
    let entries = sqlx::query_as::<_, Entry>(
        "SELECT id, telegram_id, event_time, photo_path, carbs_g, xe, sugar_before, dose
         FROM entries
         WHERE telegram_id = ?
         ORDER BY event_time DESC
         LIMIT ?",
    )
    .bind(telegram_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to read recent entries")?;

    Ok(entries)
}

/// Reminder category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReminderKind {
    Sugar,
    LongInsulin,
    Medicine,
    XeAfter,
}

impl ReminderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderKind::Sugar => "sugar",
            ReminderKind::LongInsulin => "long_insulin",
            ReminderKind::Medicine => "medicine",
            ReminderKind::XeAfter => "xe_after",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sugar" => Some(ReminderKind::Sugar),
            "long_insulin" => Some(ReminderKind::LongInsulin),
            "medicine" => Some(ReminderKind::Medicine),
            "xe_after" => Some(ReminderKind::XeAfter),
            _ => None,
        }
    }

    pub const ALL: [ReminderKind; 4] = [
        ReminderKind::Sugar,
        ReminderKind::LongInsulin,
        ReminderKind::Medicine,
        ReminderKind::XeAfter,
    ];
}

impl std::fmt::Display for ReminderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Reminder {
    pub id: i64,
    pub telegram_id: i64,
    pub kind: String,
    pub time: Option<String>,
    pub interval_hours: Option<i64>,
    pub minutes_after: Option<i64>,
}

impl Reminder {
    pub fn kind(&self) -> Option<ReminderKind> {
        ReminderKind::parse(&self.kind)
    }

    /// Human-readable description shown in lists and trigger messages.
    pub fn describe(&self) -> String {
        match self.kind() {
            Some(ReminderKind::Sugar) => match (&self.time, self.interval_hours) {
                (Some(time), _) => format!("Замерить сахар {time}"),
                (None, Some(hours)) => format!("Замерить сахар каждые {hours} ч"),
                (None, None) => "Замерить сахар".to_string(),
            },
            Some(ReminderKind::LongInsulin) => {
                format!("Длинный инсулин {}", self.time.as_deref().unwrap_or("--:--"))
            }
            Some(ReminderKind::Medicine) => {
                format!("Таблетки/лекарство {}", self.time.as_deref().unwrap_or("--:--"))
            }
            Some(ReminderKind::XeAfter) => {
                format!("Проверить ХЕ через {} мин", self.minutes_after.unwrap_or(0))
            }
            None => self.kind.clone(),
        }
    }
}

/// Schedule specification of a new reminder; exactly one field is set.
#[derive(Debug, Clone, PartialEq)]
pub enum ReminderSpec {
    /// Daily at fixed local time "HH:MM".
    Daily(String),
    /// Repeating every N hours.
    EveryHours(i64),
    /// One-shot N minutes after a meal entry is logged (`xe_after` only).
    MinutesAfterMeal(i64),
}

#[derive(Debug)]
pub enum ReminderError {
    /// The per-user cap of [`MAX_REMINDERS`] is reached; nothing was created.
    LimitExceeded,
    Db(sqlx::Error),
}

impl std::fmt::Display for ReminderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReminderError::LimitExceeded => {
                write!(f, "reminder limit of {MAX_REMINDERS} reached")
            }
            ReminderError::Db(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for ReminderError {}

impl From<sqlx::Error> for ReminderError {
    fn from(e: sqlx::Error) -> Self {
        ReminderError::Db(e)
    }
}

/// Create a reminder, enforcing the per-user cap inside one transaction.
pub async fn add_reminder(
    pool: &SqlitePool,
    telegram_id: i64,
    kind: ReminderKind,
    spec: &ReminderSpec,
) -> Result<Reminder, ReminderError> {
    let mut tx = pool.begin().await?;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reminders WHERE telegram_id = ?")
        .bind(telegram_id)
        .fetch_one(&mut *tx)
        .await?;
    if count >= MAX_REMINDERS {
        return Err(ReminderError::LimitExceeded);
    }

    let (time, interval_hours, minutes_after) = match spec {
        ReminderSpec::Daily(hhmm) => (Some(hhmm.clone()), None, None),
        ReminderSpec::EveryHours(hours) => (None, Some(*hours), None),
        ReminderSpec::MinutesAfterMeal(minutes) => (None, None, Some(*minutes)),
    };

    let result = sqlx::query(
        "INSERT INTO reminders (telegram_id, kind, time, interval_hours, minutes_after)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(telegram_id)
    .bind(kind.as_str())
    .bind(&time)
    .bind(interval_hours)
    .bind(minutes_after)
    .execute(&mut *tx)
    .await?;

    let id = result.last_insert_rowid();
    tx.commit().await?;

    info!(user_id = telegram_id, reminder_id = id, kind = %kind, "Reminder created");
    Ok(Reminder {
        id,
        telegram_id,
        kind: kind.as_str().to_string(),
        time,
        interval_hours,
        minutes_after,
    })
}

pub async fn get_reminder(pool: &SqlitePool, reminder_id: i64) -> Result<Option<Reminder>> {
    let reminder = sqlx::query_as::<_, Reminder>(
        "SELECT id, telegram_id, kind, time, interval_hours, minutes_after
         FROM reminders WHERE id = ?",
    )
    .bind(reminder_id)
    .fetch_optional(pool)
    .await
    .context("Failed to read reminder")?;

    Ok(reminder)
}

pub async fn list_reminders(pool: &SqlitePool, telegram_id: i64) -> Result<Vec<Reminder>> {
    let reminders = sqlx::query_as::<_, Reminder>(
        "SELECT id, telegram_id, kind, time, interval_hours, minutes_after
         FROM reminders WHERE telegram_id = ? ORDER BY id",
    )
    .bind(telegram_id)
    .fetch_all(pool)
    .await
    .context("Failed to list reminders")?;

    Ok(reminders)
}

/// All reminders of every user; used for the startup replay.
pub async fn all_reminders(pool: &SqlitePool) -> Result<Vec<Reminder>> {
    let reminders = sqlx::query_as::<_, Reminder>(
        "SELECT id, telegram_id, kind, time, interval_hours, minutes_after
         FROM reminders ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list all reminders")?;

    Ok(reminders)
}

pub async fn reminders_of_kind(
    pool: &SqlitePool,
    telegram_id: i64,
    kind: ReminderKind,
) -> Result<Vec<Reminder>> {
    let reminders = sqlx::query_as::<_, Reminder>(
        "SELECT id, telegram_id, kind, time, interval_hours, minutes_after
         FROM reminders WHERE telegram_id = ? AND kind = ? ORDER BY id",
    )
    .bind(telegram_id)
    .bind(kind.as_str())
    .fetch_all(pool)
    .await
    .context("Failed to list reminders by kind")?;

    Ok(reminders)
}

pub async fn delete_reminder(pool: &SqlitePool, reminder_id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM reminders WHERE id = ?")
        .bind(reminder_id)
        .execute(pool)
        .await
        .context("Failed to delete reminder")?;

    Ok(result.rows_affected() > 0)
}

/// Append one row to the reminder audit log.
pub async fn log_reminder_action(
    pool: &SqlitePool,
    reminder_id: i64,
    telegram_id: i64,
    action: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO reminder_logs (reminder_id, telegram_id, action) VALUES (?, ?, ?)")
        .bind(reminder_id)
        .bind(telegram_id)
        .bind(action)
        .execute(pool)
        .await
        .context("Failed to log reminder action")?;

    Ok(())
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ReminderLogRow {
    pub id: i64,
    pub reminder_id: i64,
    pub telegram_id: i64,
    pub action: String,
}

pub async fn reminder_log(pool: &SqlitePool, reminder_id: i64) -> Result<Vec<ReminderLogRow>> {
    let rows = sqlx::query_as::<_, ReminderLogRow>(
        "SELECT id, reminder_id, telegram_id, action FROM reminder_logs
         WHERE reminder_id = ? ORDER BY id",
    )
    .bind(reminder_id)
    .fetch_all(pool)
    .await
    .context("Failed to read reminder log")?;

    Ok(rows)
}

/// Explicit user reset: removes entries, profile, reminders, reminder log
/// rows and the user record itself in one transaction.
pub async fn reset_user(pool: &SqlitePool, telegram_id: i64) -> Result<()> {
    let mut tx = pool.begin().await.context("Failed to begin reset")?;

    for table in ["reminder_logs", "reminders", "entries", "profiles", "users"] {
        let sql = format!("DELETE FROM {table} WHERE telegram_id = ?");
        sqlx::query(&sql)
            .bind(telegram_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to clear {table}"))?;
    }

    tx.commit().await.context("Failed to commit reset")?;
    info!(user_id = telegram_id, "User data reset");
    Ok(())
}
