//! Embedded SQL migrations with a checksum ledger.
//!
//! Each file runs once, statement by statement, inside a transaction. An
//! already-applied file whose checksum no longer matches aborts startup:
//! migrations are append-only.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use sqlx::{Executor, Row, SqlitePool};
use tracing::{error, info};

use crate::time::now_ms;

static MIGRATIONS: &[(&str, &str)] = &[
    (
        "202508011200_initial.sql",
        include_str!("../migrations/202508011200_initial.sql"),
    ),
    (
        "202508011201_domain_tables.sql",
        include_str!("../migrations/202508011201_domain_tables.sql"),
    ),
    (
        "202508011202_ops_tables.sql",
        include_str!("../migrations/202508011202_ops_tables.sql"),
    ),
    (
        "202508251300_auth_code_purposes.sql",
        include_str!("../migrations/202508251300_auth_code_purposes.sql"),
    ),
];

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.len() > 160 {
        format!("{}…", &trimmed[..160])
    } else {
        trimmed.to_string()
    }
}

fn strip_comments(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version    TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum   TEXT NOT NULL\
         )",
    )
    .await?;

    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let mut applied: HashMap<String, String> = HashMap::new();
    for r in rows {
        if let (Ok(v), Ok(c)) = (
            r.try_get::<String, _>("version"),
            r.try_get::<String, _>("checksum"),
        ) {
            applied.insert(v, c);
        }
    }

    for (filename, raw_sql) in MIGRATIONS {
        let cleaned = strip_comments(raw_sql);
        let checksum = format!("{:x}", Sha256::digest(cleaned.as_bytes()));

        if let Some(stored) = applied.get(*filename) {
            if stored != &checksum {
                anyhow::bail!("migration {} edited after application", filename);
            }
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in cleaned.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            let upper = s.to_ascii_uppercase();
            // The pool transaction already brackets the file.
            if upper == "BEGIN" || upper == "COMMIT" {
                continue;
            }
            if let Err(e) = sqlx::query(s).execute(&mut *tx).await {
                error!(target: "gamwich", event = "migration_stmt_error", file = %filename, sql = %preview(s), error = %e);
                return Err(e.into());
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?, ?, ?)",
        )
        .bind(*filename)
        .bind(now_ms())
        .bind(&checksum)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(target: "gamwich", event = "migration_applied", file = %filename);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("memory pool")
    }

    #[tokio::test]
    async fn applies_all_migrations_and_is_idempotent() {
        let pool = memory_pool().await;
        apply_migrations(&pool).await.expect("first run");
        apply_migrations(&pool).await.expect("second run");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());

        for table in [
            "households",
            "users",
            "memberships",
            "sessions",
            "auth_codes",
            "events",
            "event_exceptions",
            "chores",
            "chore_completions",
            "grocery_items",
            "notes",
            "rewards",
            "reward_redemptions",
            "backup_records",
            "push_subscriptions",
            "push_preferences",
            "sent_notifications",
            "settings",
        ] {
            let found: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_optional(&pool)
            .await
            .unwrap();
            assert!(found.is_some(), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn edited_migration_is_rejected() {
        let pool = memory_pool().await;
        apply_migrations(&pool).await.expect("apply");

        sqlx::query("UPDATE schema_migrations SET checksum = 'deadbeef' WHERE version = ?")
            .bind(MIGRATIONS[0].0)
            .execute(&pool)
            .await
            .unwrap();

        let err = apply_migrations(&pool).await.expect_err("tamper");
        assert!(err.to_string().contains("edited after application"));
    }
}
