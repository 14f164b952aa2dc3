use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::{AppError, AppResult};
use crate::time::now_ms;

#[derive(Debug, Clone, Serialize)]
pub struct Note {
    pub id: i64,
    pub household_id: i64,
    pub title: String,
    pub body: String,
    pub color: Option<String>,
    pub pinned: bool,
    pub created_by: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoteInput {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub pinned: bool,
}

const COLUMNS: &str =
    "id, household_id, title, body, color, pinned, created_by, created_at, updated_at";

fn from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<Note> {
    Ok(Note {
        id: row.try_get("id")?,
        household_id: row.try_get("household_id")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        color: row.try_get("color")?,
        pinned: row.try_get::<i64, _>("pinned")? != 0,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn create(
    pool: &SqlitePool,
    household_id: i64,
    created_by: i64,
    input: &NoteInput,
) -> AppResult<Note> {
    if input.title.trim().is_empty() && input.body.trim().is_empty() {
        return Err(AppError::validation("A note needs a title or a body"));
    }
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO notes (household_id, title, body, color, pinned, created_by, created_at, \
         updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(household_id)
    .bind(input.title.trim())
    .bind(&input.body)
    .bind(&input.color)
    .bind(input.pinned as i64)
    .bind(created_by)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    get(pool, household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Note"))
}

pub async fn get(pool: &SqlitePool, household_id: i64, id: i64) -> AppResult<Option<Note>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM notes WHERE id = ? AND household_id = ?"
    ))
    .bind(id)
    .bind(household_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list(pool: &SqlitePool, household_id: i64) -> AppResult<Vec<Note>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM notes WHERE household_id = ? \
         ORDER BY pinned DESC, updated_at DESC"
    ))
    .bind(household_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn update(
    pool: &SqlitePool,
    household_id: i64,
    id: i64,
    input: &NoteInput,
) -> AppResult<Note> {
    if input.title.trim().is_empty() && input.body.trim().is_empty() {
        return Err(AppError::validation("A note needs a title or a body"));
    }
    let result = sqlx::query(
        "UPDATE notes SET title = ?, body = ?, color = ?, pinned = ?, updated_at = ? \
         WHERE id = ? AND household_id = ?",
    )
    .bind(input.title.trim())
    .bind(&input.body)
    .bind(&input.color)
    .bind(input.pinned as i64)
    .bind(now_ms())
    .bind(id)
    .bind(household_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Note"));
    }
    get(pool, household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Note"))
}

pub async fn delete(pool: &SqlitePool, household_id: i64, id: i64) -> AppResult<()> {
    let result = sqlx::query("DELETE FROM notes WHERE id = ? AND household_id = ?")
        .bind(id)
        .bind(household_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Note"));
    }
    Ok(())
}
