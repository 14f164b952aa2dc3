//! Backup record lifecycle: pending -> uploading -> completed | failed.
//!
//! Transitions are guarded in SQL, so a stale worker cannot move a record
//! backwards or overwrite a terminal state.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::error::{AppError, AppResult};
use crate::time::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Uploading => "uploading",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> AppResult<Self> {
        match raw {
            "pending" => Ok(BackupStatus::Pending),
            "uploading" => Ok(BackupStatus::Uploading),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(AppError::new(
                "DB_BACKUP/BAD_STATUS",
                format!("unknown backup status {other:?}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupRecord {
    pub id: i64,
    pub household_id: i64,
    pub status: BackupStatus,
    pub object_key: Option<String>,
    pub size_bytes: Option<i64>,
    pub error: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

const COLUMNS: &str =
    "id, household_id, status, object_key, size_bytes, error, created_at, completed_at";

fn from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<BackupRecord> {
    Ok(BackupRecord {
        id: row.try_get("id")?,
        household_id: row.try_get("household_id")?,
        status: BackupStatus::parse(&row.try_get::<String, _>("status")?)?,
        object_key: row.try_get("object_key")?,
        size_bytes: row.try_get("size_bytes")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

pub async fn create_pending(pool: &SqlitePool, household_id: i64) -> AppResult<BackupRecord> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO backup_records (household_id, status, created_at) \
         VALUES (?, 'pending', ?) RETURNING id",
    )
    .bind(household_id)
    .bind(now_ms())
    .fetch_one(pool)
    .await?;
    get(pool, household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Backup record"))
}

pub async fn get(
    pool: &SqlitePool,
    household_id: i64,
    id: i64,
) -> AppResult<Option<BackupRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM backup_records WHERE id = ? AND household_id = ?"
    ))
    .bind(id)
    .bind(household_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list(
    pool: &SqlitePool,
    household_id: i64,
    limit: i64,
) -> AppResult<Vec<BackupRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM backup_records WHERE household_id = ? \
         ORDER BY created_at DESC, id DESC LIMIT ?"
    ))
    .bind(household_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

fn guard_transition(
    result: sqlx::sqlite::SqliteQueryResult,
    id: i64,
    expected: BackupStatus,
) -> AppResult<()> {
    if result.rows_affected() == 0 {
        return Err(AppError::new(
            "DB_BACKUP/BAD_TRANSITION",
            "Backup record is not in the expected state",
        )
        .with_context("id", id.to_string())
        .with_context("expected", expected.as_str().to_string()));
    }
    Ok(())
}

pub async fn mark_uploading(pool: &SqlitePool, id: i64, object_key: &str) -> AppResult<()> {
    let result = sqlx::query(
        "UPDATE backup_records SET status = 'uploading', object_key = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(object_key)
    .bind(id)
    .execute(pool)
    .await?;
    guard_transition(result, id, BackupStatus::Pending)
}

pub async fn mark_completed(pool: &SqlitePool, id: i64, size_bytes: i64) -> AppResult<()> {
    let result = sqlx::query(
        "UPDATE backup_records SET status = 'completed', size_bytes = ?, completed_at = ? \
         WHERE id = ? AND status = 'uploading'",
    )
    .bind(size_bytes)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    guard_transition(result, id, BackupStatus::Uploading)
}

/// Only a record that reached `uploading` may fail. The worker assigns the
/// object key before any fallible work, so `pending` never jumps straight
/// to `failed`, and a terminal record never changes again.
pub async fn mark_failed(pool: &SqlitePool, id: i64, error: &str) -> AppResult<()> {
    let result = sqlx::query(
        "UPDATE backup_records SET status = 'failed', error = ?, completed_at = ? \
         WHERE id = ? AND status = 'uploading'",
    )
    .bind(error)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    guard_transition(result, id, BackupStatus::Uploading)
}

/// Completed records older than the cutoff. The caller deletes the objects
/// first and then calls [`delete`] per record, so a storage failure leaves
/// the record (and a retry path) in place.
pub async fn completed_before(
    pool: &SqlitePool,
    household_id: i64,
    cutoff_ms: i64,
) -> AppResult<Vec<BackupRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM backup_records \
         WHERE household_id = ? AND status = 'completed' AND created_at < ?"
    ))
    .bind(household_id)
    .bind(cutoff_ms)
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn delete(pool: &SqlitePool, household_id: i64, id: i64) -> AppResult<()> {
    sqlx::query("DELETE FROM backup_records WHERE id = ? AND household_id = ?")
        .bind(id)
        .bind(household_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_migrations;
    use crate::store::household::create_household_with_admin;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn fixture() -> (SqlitePool, i64) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_migrations(&pool).await.unwrap();
        let (hh, _) = create_household_with_admin(&pool, "Bag End", "a@x.example", "A")
            .await
            .unwrap();
        (pool, hh.id)
    }

    #[tokio::test]
    async fn happy_path_transitions() {
        let (pool, hh) = fixture().await;
        let record = create_pending(&pool, hh).await.unwrap();
        assert_eq!(record.status, BackupStatus::Pending);

        mark_uploading(&pool, record.id, "1/backup-20250101T000000Z.db.enc")
            .await
            .unwrap();
        mark_completed(&pool, record.id, 4096).await.unwrap();

        let record = get(&pool, hh, record.id).await.unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.size_bytes, Some(4096));
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let (pool, hh) = fixture().await;
        let record = create_pending(&pool, hh).await.unwrap();
        mark_uploading(&pool, record.id, "k").await.unwrap();
        mark_failed(&pool, record.id, "upload timed out")
            .await
            .unwrap();

        assert!(mark_uploading(&pool, record.id, "k2").await.is_err());
        assert!(mark_completed(&pool, record.id, 1).await.is_err());
        assert!(mark_failed(&pool, record.id, "again").await.is_err());

        let record = get(&pool, hh, record.id).await.unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("upload timed out"));
    }

    #[tokio::test]
    async fn pending_cannot_jump_to_a_terminal_state() {
        let (pool, hh) = fixture().await;
        let record = create_pending(&pool, hh).await.unwrap();
        assert!(mark_completed(&pool, record.id, 1).await.is_err());
        assert!(mark_failed(&pool, record.id, "boom").await.is_err());

        let record = get(&pool, hh, record.id).await.unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Pending);
    }

    #[tokio::test]
    async fn object_keys_are_unique() {
        let (pool, hh) = fixture().await;
        let first = create_pending(&pool, hh).await.unwrap();
        mark_uploading(&pool, first.id, "1/backup-20250101T000000Z.db.enc")
            .await
            .unwrap();
        let second = create_pending(&pool, hh).await.unwrap();
        let err = mark_uploading(&pool, second.id, "1/backup-20250101T000000Z.db.enc")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT/UNIQUE");
    }

    #[tokio::test]
    async fn retention_query_only_sees_old_completed() {
        let (pool, hh) = fixture().await;
        let done = create_pending(&pool, hh).await.unwrap();
        mark_uploading(&pool, done.id, "k1").await.unwrap();
        mark_completed(&pool, done.id, 1).await.unwrap();
        let pending = create_pending(&pool, hh).await.unwrap();

        let future_cutoff = now_ms() + 1_000;
        let old = completed_before(&pool, hh, future_cutoff).await.unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].id, done.id);
        assert_ne!(old[0].id, pending.id);
    }
}
