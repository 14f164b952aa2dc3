//! Calendar events, recurrence expansion, and per-occurrence exceptions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::recurrence::{reconcile, Reconciled, Rule};
use crate::time::{now_ms, to_date};

pub const ALL_DAY_DURATION_MS: i64 = 24 * 60 * 60 * 1000;
/// An event created without an explicit end runs for one hour.
pub const DEFAULT_DURATION_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: i64,
    pub household_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub start_at: i64,
    pub end_at: i64,
    pub all_day: bool,
    pub rrule: Option<String>,
    pub reminder_minutes: Option<i64>,
    pub created_by: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventException {
    pub id: i64,
    pub event_id: i64,
    pub original_start: i64,
    pub cancelled: bool,
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_at: Option<i64>,
    pub end_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventInput {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub start_at: i64,
    #[serde(default)]
    pub end_at: Option<i64>,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub rrule: Option<String>,
    #[serde(default)]
    pub reminder_minutes: Option<i64>,
}

impl EventInput {
    /// Normalize and validate. All-day events always span one full UTC day.
    fn normalized(&self) -> AppResult<(String, i64, i64, Option<String>)> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(AppError::validation("Title must not be empty"));
        }
        let end_at = if self.all_day {
            self.start_at + ALL_DAY_DURATION_MS
        } else {
            self.end_at.unwrap_or(self.start_at + DEFAULT_DURATION_MS)
        };
        if end_at <= self.start_at {
            return Err(AppError::validation("Event must end after it starts"));
        }
        let rrule = match self.rrule.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                Rule::parse(raw).map_err(|e| AppError::validation(e.to_string()))?;
                Some(raw.to_string())
            }
        };
        if let Some(minutes) = self.reminder_minutes {
            if minutes < 0 {
                return Err(AppError::validation("Reminder minutes must not be negative"));
            }
        }
        Ok((title, self.start_at, end_at, rrule))
    }
}

/// One row of an expanded calendar listing. Virtual occurrences of a
/// recurring parent share its `event_id`; `original_start` identifies the
/// slot an exception applies to.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CalendarEntry {
    pub event_id: i64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start_at: i64,
    pub end_at: i64,
    pub all_day: bool,
    pub recurring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_start: Option<i64>,
}

fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<Event> {
    Ok(Event {
        id: row.try_get("id")?,
        household_id: row.try_get("household_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        start_at: row.try_get("start_at")?,
        end_at: row.try_get("end_at")?,
        all_day: row.try_get::<i64, _>("all_day")? != 0,
        rrule: row.try_get("rrule")?,
        reminder_minutes: row.try_get("reminder_minutes")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn exception_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<EventException> {
    Ok(EventException {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        original_start: row.try_get("original_start")?,
        cancelled: row.try_get::<i64, _>("cancelled")? != 0,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        start_at: row.try_get("start_at")?,
        end_at: row.try_get("end_at")?,
    })
}

const EVENT_COLUMNS: &str = "id, household_id, title, description, start_at, end_at, all_day, \
                             rrule, reminder_minutes, created_by, created_at, updated_at";

pub async fn create(
    pool: &SqlitePool,
    household_id: i64,
    created_by: i64,
    input: &EventInput,
) -> AppResult<Event> {
    let (title, start_at, end_at, rrule) = input.normalized()?;
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO events (household_id, title, description, start_at, end_at, all_day, \
         rrule, reminder_minutes, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(household_id)
    .bind(&title)
    .bind(&input.description)
    .bind(start_at)
    .bind(end_at)
    .bind(input.all_day as i64)
    .bind(&rrule)
    .bind(input.reminder_minutes)
    .bind(created_by)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    get(pool, household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Event"))
}

pub async fn get(pool: &SqlitePool, household_id: i64, id: i64) -> AppResult<Option<Event>> {
    let row = sqlx::query(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE id = ? AND household_id = ?"
    ))
    .bind(id)
    .bind(household_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(event_from_row).transpose()
}

pub async fn update(
    pool: &SqlitePool,
    household_id: i64,
    id: i64,
    input: &EventInput,
) -> AppResult<Event> {
    let (title, start_at, end_at, rrule) = input.normalized()?;
    let result = sqlx::query(
        "UPDATE events SET title = ?, description = ?, start_at = ?, end_at = ?, all_day = ?, \
         rrule = ?, reminder_minutes = ?, updated_at = ? WHERE id = ? AND household_id = ?",
    )
    .bind(&title)
    .bind(&input.description)
    .bind(start_at)
    .bind(end_at)
    .bind(input.all_day as i64)
    .bind(&rrule)
    .bind(input.reminder_minutes)
    .bind(now_ms())
    .bind(id)
    .bind(household_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Event"));
    }
    get(pool, household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Event"))
}

pub async fn delete(pool: &SqlitePool, household_id: i64, id: i64) -> AppResult<()> {
    let result = sqlx::query("DELETE FROM events WHERE id = ? AND household_id = ?")
        .bind(id)
        .bind(household_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Event"));
    }
    Ok(())
}

/// Create or replace the exception for one occurrence slot.
pub async fn upsert_exception(
    pool: &SqlitePool,
    household_id: i64,
    event_id: i64,
    original_start: i64,
    cancelled: bool,
    title: Option<&str>,
    description: Option<&str>,
    start_at: Option<i64>,
    end_at: Option<i64>,
) -> AppResult<EventException> {
    let parent = get(pool, household_id, event_id)
        .await?
        .ok_or_else(|| AppError::not_found("Event"))?;
    if parent.rrule.is_none() {
        return Err(AppError::validation(
            "Exceptions only apply to recurring events",
        ));
    }
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO event_exceptions \
         (event_id, original_start, cancelled, title, description, start_at, end_at, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (event_id, original_start) DO UPDATE SET \
           cancelled = excluded.cancelled, title = excluded.title, \
           description = excluded.description, start_at = excluded.start_at, \
           end_at = excluded.end_at, updated_at = excluded.updated_at \
         RETURNING id",
    )
    .bind(event_id)
    .bind(original_start)
    .bind(cancelled as i64)
    .bind(title)
    .bind(description)
    .bind(start_at)
    .bind(end_at)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(EventException {
        id,
        event_id,
        original_start,
        cancelled,
        title: title.map(str::to_string),
        description: description.map(str::to_string),
        start_at,
        end_at,
    })
}

pub async fn delete_exception(
    pool: &SqlitePool,
    household_id: i64,
    event_id: i64,
    original_start: i64,
) -> AppResult<()> {
    let result = sqlx::query(
        "DELETE FROM event_exceptions WHERE event_id = ? AND original_start = ? \
         AND event_id IN (SELECT id FROM events WHERE household_id = ?)",
    )
    .bind(event_id)
    .bind(original_start)
    .bind(household_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Exception"));
    }
    Ok(())
}

async fn exceptions_for(pool: &SqlitePool, event_id: i64) -> AppResult<Vec<EventException>> {
    let rows = sqlx::query(
        "SELECT id, event_id, original_start, cancelled, title, description, start_at, end_at \
         FROM event_exceptions WHERE event_id = ?",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(exception_from_row).collect()
}

/// Expand the household's calendar into `[from_ms, to_ms)`. Recurring
/// parents with an unparsable stored rule are logged and skipped so the rest
/// of the calendar still renders.
pub async fn list_window(
    pool: &SqlitePool,
    household_id: i64,
    from_ms: i64,
    to_ms: i64,
) -> AppResult<Vec<CalendarEntry>> {
    if to_ms <= from_ms {
        return Err(AppError::validation("Window end must be after its start"));
    }
    let mut entries: Vec<CalendarEntry> = Vec::new();

    // Non-recurring events overlap the window.
    let rows = sqlx::query(&format!(
        "SELECT {EVENT_COLUMNS} FROM events \
         WHERE household_id = ? AND rrule IS NULL AND end_at > ? AND start_at < ?"
    ))
    .bind(household_id)
    .bind(from_ms)
    .bind(to_ms)
    .fetch_all(pool)
    .await?;
    for row in &rows {
        let event = event_from_row(row)?;
        entries.push(CalendarEntry {
            event_id: event.id,
            title: event.title,
            description: event.description,
            start_at: event.start_at,
            end_at: event.end_at,
            all_day: event.all_day,
            recurring: false,
            original_start: None,
        });
    }

    // Recurring parents started before the window closes.
    let rows = sqlx::query(&format!(
        "SELECT {EVENT_COLUMNS} FROM events \
         WHERE household_id = ? AND rrule IS NOT NULL AND start_at < ?"
    ))
    .bind(household_id)
    .bind(to_ms)
    .fetch_all(pool)
    .await?;
    for row in &rows {
        let event = event_from_row(row)?;
        let raw = event.rrule.as_deref().unwrap_or_default();
        let rule = match Rule::parse(raw) {
            Ok(rule) => rule,
            Err(err) => {
                warn!(target: "gamwich", event_id = event.id, error = %err, "calendar_skip_bad_rule");
                continue;
            }
        };
        let exceptions: HashMap<DateTime<Utc>, EventException> = exceptions_for(pool, event.id)
            .await?
            .into_iter()
            .map(|exc| (to_date(exc.original_start), exc))
            .collect();

        let occurrences = rule.expand(
            to_date(event.start_at),
            to_date(event.end_at),
            to_date(from_ms),
            to_date(to_ms),
        );
        for entry in reconcile(occurrences, &exceptions, |exc| exc.cancelled) {
            match entry {
                Reconciled::Occurrence { start, end } => entries.push(CalendarEntry {
                    event_id: event.id,
                    title: event.title.clone(),
                    description: event.description.clone(),
                    start_at: start.timestamp_millis(),
                    end_at: end.timestamp_millis(),
                    all_day: event.all_day,
                    recurring: true,
                    original_start: Some(start.timestamp_millis()),
                }),
                Reconciled::Overridden {
                    original_start,
                    exception,
                } => {
                    let original_ms = original_start.timestamp_millis();
                    let start_at = exception.start_at.unwrap_or(original_ms);
                    let duration = event.end_at - event.start_at;
                    let end_at = exception.end_at.unwrap_or(start_at + duration);
                    entries.push(CalendarEntry {
                        event_id: event.id,
                        title: exception
                            .title
                            .clone()
                            .unwrap_or_else(|| event.title.clone()),
                        description: exception
                            .description
                            .clone()
                            .or_else(|| event.description.clone()),
                        start_at,
                        end_at,
                        all_day: event.all_day,
                        recurring: true,
                        original_start: Some(original_ms),
                    });
                }
            }
        }
    }

    entries.sort_by(|a, b| {
        a.start_at
            .cmp(&b.start_at)
            .then(a.event_id.cmp(&b.event_id))
    });
    Ok(entries)
}

/// Parents with a reminder configured, for the notification tick.
pub async fn events_with_reminders(
    pool: &SqlitePool,
    household_id: i64,
) -> AppResult<Vec<Event>> {
    let rows = sqlx::query(&format!(
        "SELECT {EVENT_COLUMNS} FROM events \
         WHERE household_id = ? AND reminder_minutes IS NOT NULL"
    ))
    .bind(household_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(event_from_row).collect()
}
