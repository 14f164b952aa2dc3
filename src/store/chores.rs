//! Chores with optional recurrence and a completion ledger that feeds the
//! rewards point balance.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::recurrence::Rule;
use crate::time::{now_ms, to_date};

#[derive(Debug, Clone, Serialize)]
pub struct Chore {
    pub id: i64,
    pub household_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub assigned_to: Option<i64>,
    pub due_at: Option<i64>,
    pub rrule: Option<String>,
    pub points: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoreInput {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<i64>,
    #[serde(default)]
    pub due_at: Option<i64>,
    #[serde(default)]
    pub rrule: Option<String>,
    #[serde(default)]
    pub points: i64,
}

impl ChoreInput {
    fn normalized(&self) -> AppResult<(String, Option<String>)> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(AppError::validation("Title must not be empty"));
        }
        if self.points < 0 {
            return Err(AppError::validation("Points must not be negative"));
        }
        let rrule = match self.rrule.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                if self.due_at.is_none() {
                    return Err(AppError::validation(
                        "A recurring chore needs a due date to anchor the schedule",
                    ));
                }
                Rule::parse(raw).map_err(|e| AppError::validation(e.to_string()))?;
                Some(raw.to_string())
            }
        };
        Ok((title, rrule))
    }
}

const CHORE_COLUMNS: &str = "id, household_id, title, description, assigned_to, due_at, rrule, \
                             points, created_at, updated_at";

fn chore_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<Chore> {
    Ok(Chore {
        id: row.try_get("id")?,
        household_id: row.try_get("household_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        assigned_to: row.try_get("assigned_to")?,
        due_at: row.try_get("due_at")?,
        rrule: row.try_get("rrule")?,
        points: row.try_get("points")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn create(pool: &SqlitePool, household_id: i64, input: &ChoreInput) -> AppResult<Chore> {
    let (title, rrule) = input.normalized()?;
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO chores (household_id, title, description, assigned_to, due_at, rrule, \
         points, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(household_id)
    .bind(&title)
    .bind(&input.description)
    .bind(input.assigned_to)
    .bind(input.due_at)
    .bind(&rrule)
    .bind(input.points)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    get(pool, household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Chore"))
}

pub async fn get(pool: &SqlitePool, household_id: i64, id: i64) -> AppResult<Option<Chore>> {
    let row = sqlx::query(&format!(
        "SELECT {CHORE_COLUMNS} FROM chores WHERE id = ? AND household_id = ?"
    ))
    .bind(id)
    .bind(household_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(chore_from_row).transpose()
}

pub async fn list(pool: &SqlitePool, household_id: i64) -> AppResult<Vec<Chore>> {
    let rows = sqlx::query(&format!(
        "SELECT {CHORE_COLUMNS} FROM chores WHERE household_id = ? \
         ORDER BY due_at IS NULL, due_at, id"
    ))
    .bind(household_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(chore_from_row).collect()
}

pub async fn update(
    pool: &SqlitePool,
    household_id: i64,
    id: i64,
    input: &ChoreInput,
) -> AppResult<Chore> {
    let (title, rrule) = input.normalized()?;
    let result = sqlx::query(
        "UPDATE chores SET title = ?, description = ?, assigned_to = ?, due_at = ?, rrule = ?, \
         points = ?, updated_at = ? WHERE id = ? AND household_id = ?",
    )
    .bind(&title)
    .bind(&input.description)
    .bind(input.assigned_to)
    .bind(input.due_at)
    .bind(&rrule)
    .bind(input.points)
    .bind(now_ms())
    .bind(id)
    .bind(household_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Chore"));
    }
    get(pool, household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Chore"))
}

pub async fn delete(pool: &SqlitePool, household_id: i64, id: i64) -> AppResult<()> {
    let result = sqlx::query("DELETE FROM chores WHERE id = ? AND household_id = ?")
        .bind(id)
        .bind(household_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Chore"));
    }
    Ok(())
}

/// Record a completion, credit its points, and roll a recurring chore's due
/// date forward to the next occurrence after now. A one-off chore keeps its
/// due date so it reads as done-late or done-early in the UI.
pub async fn complete(
    pool: &SqlitePool,
    household_id: i64,
    id: i64,
    user_id: i64,
) -> AppResult<Chore> {
    let chore = get(pool, household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Chore"))?;
    let now = now_ms();

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO chore_completions (chore_id, user_id, completed_at, points) VALUES (?, ?, ?, ?)",
    )
    .bind(id)
    .bind(user_id)
    .bind(now)
    .bind(chore.points)
    .execute(&mut *tx)
    .await?;

    if let (Some(raw), Some(due_at)) = (chore.rrule.as_deref(), chore.due_at) {
        match Rule::parse(raw) {
            Ok(rule) => {
                let next = next_due_after(&rule, due_at, now);
                sqlx::query("UPDATE chores SET due_at = ?, updated_at = ? WHERE id = ?")
                    .bind(next)
                    .bind(now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            Err(err) => {
                warn!(target: "gamwich", chore_id = id, error = %err, "chore_skip_bad_rule");
            }
        }
    }
    tx.commit().await?;

    get(pool, household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Chore"))
}

/// First occurrence strictly after `after_ms`, within a two-year horizon.
/// `None` when the series has ended.
pub fn next_due_after(rule: &Rule, anchor_ms: i64, after_ms: i64) -> Option<i64> {
    const HORIZON_MS: i64 = 2 * 366 * 24 * 60 * 60 * 1000;
    let anchor = to_date(anchor_ms);
    rule.expand(
        anchor,
        anchor,
        to_date(after_ms + 1),
        to_date(after_ms + HORIZON_MS),
    )
    .map(|(start, _)| start.timestamp_millis())
    .find(|start| *start > after_ms)
}

/// Points earned minus points spent, for one user.
pub async fn point_balance(pool: &SqlitePool, user_id: i64) -> AppResult<i64> {
    let earned: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(points), 0) FROM chore_completions WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    let spent: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(cost), 0) FROM reward_redemptions WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(earned - spent)
}

/// Chores due inside `[from_ms, to_ms)`, for the notification tick.
pub async fn due_in_window(
    pool: &SqlitePool,
    household_id: i64,
    from_ms: i64,
    to_ms: i64,
) -> AppResult<Vec<Chore>> {
    let rows = sqlx::query(&format!(
        "SELECT {CHORE_COLUMNS} FROM chores \
         WHERE household_id = ? AND due_at IS NOT NULL AND due_at >= ? AND due_at < ?"
    ))
    .bind(household_id)
    .bind(from_ms)
    .bind(to_ms)
    .fetch_all(pool)
    .await?;
    rows.iter().map(chore_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_migrations;
    use crate::store::household::create_household_with_admin;
    use sqlx::sqlite::SqlitePoolOptions;

    const HOUR: i64 = 3_600_000;
    const DAY: i64 = 24 * HOUR;

    async fn fixture() -> (SqlitePool, i64, i64) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_migrations(&pool).await.unwrap();
        let (hh, user) = create_household_with_admin(&pool, "Bag End", "a@x.example", "A")
            .await
            .unwrap();
        (pool, hh.id, user.id)
    }

    fn weekly(due_at: i64, points: i64) -> ChoreInput {
        ChoreInput {
            title: "Bins out".to_string(),
            description: None,
            assigned_to: None,
            due_at: Some(due_at),
            rrule: Some("FREQ=WEEKLY".to_string()),
            points,
        }
    }

    #[tokio::test]
    async fn recurring_chore_requires_due_date() {
        let (pool, hh, _) = fixture().await;
        let mut input = weekly(0, 5);
        input.due_at = None;
        let err = create(&pool, hh, &input).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION/BAD_REQUEST");
    }

    #[tokio::test]
    async fn completion_credits_points_and_rolls_due_date() {
        let (pool, hh, user) = fixture().await;
        let due = now_ms() - HOUR; // overdue
        let chore = create(&pool, hh, &weekly(due, 5)).await.unwrap();

        let updated = complete(&pool, hh, chore.id, user).await.unwrap();
        let next = updated.due_at.expect("rolled forward");
        assert!(next > now_ms());
        assert_eq!((next - due) % (7 * DAY), 0);
        assert_eq!(point_balance(&pool, user).await.unwrap(), 5);

        complete(&pool, hh, chore.id, user).await.unwrap();
        assert_eq!(point_balance(&pool, user).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn one_off_chore_keeps_due_date_on_completion() {
        let (pool, hh, user) = fixture().await;
        let chore = create(
            &pool,
            hh,
            &ChoreInput {
                title: "Fix gate".to_string(),
                description: None,
                assigned_to: Some(user),
                due_at: Some(DAY),
                rrule: None,
                points: 3,
            },
        )
        .await
        .unwrap();
        let updated = complete(&pool, hh, chore.id, user).await.unwrap();
        assert_eq!(updated.due_at, Some(DAY));
    }

    #[test]
    fn next_due_skips_to_future_occurrence() {
        let rule = Rule::parse("FREQ=DAILY").unwrap();
        // Anchor long in the past; next due is strictly after `after`.
        let next = next_due_after(&rule, 9 * HOUR, 40 * DAY + 10 * HOUR).unwrap();
        assert_eq!(next, 41 * DAY + 9 * HOUR);
    }

    #[test]
    fn next_due_none_when_series_over() {
        let rule = Rule::parse("FREQ=DAILY;COUNT=3").unwrap();
        assert_eq!(next_due_after(&rule, 0, 10 * DAY), None);
    }

    #[tokio::test]
    async fn due_window_is_half_open() {
        let (pool, hh, _) = fixture().await;
        for (title, due) in [("a", HOUR), ("b", 2 * HOUR), ("c", 3 * HOUR)] {
            create(
                &pool,
                hh,
                &ChoreInput {
                    title: title.to_string(),
                    description: None,
                    assigned_to: None,
                    due_at: Some(due),
                    rrule: None,
                    points: 0,
                },
            )
            .await
            .unwrap();
        }
        let due = due_in_window(&pool, hh, HOUR, 3 * HOUR).await.unwrap();
        let titles: Vec<&str> = due.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "b"]);
    }
}
