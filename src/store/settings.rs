//! Per-household key/value settings with hot reload.
//!
//! Writes go through [`SettingsService::set`], which awaits every matching
//! reload hook before returning. A caller that saw `set` succeed can assume
//! the affected subsystem already runs with the new value.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::time::now_ms;

pub mod keys {
    pub const BACKUP_ENABLED: &str = "backup.enabled";
    /// Accepted on the settings API but never persisted; the write seeds the
    /// backup manager's in-memory credential cache instead.
    pub const BACKUP_PASSPHRASE: &str = "backup.passphrase";
    pub const BACKUP_SALT: &str = "backup.salt";
    pub const BACKUP_SCHEDULE_HOUR: &str = "backup.schedule_hour";
    pub const BACKUP_RETENTION_DAYS: &str = "backup.retention_days";
    pub const S3_ENDPOINT: &str = "s3.endpoint";
    pub const S3_REGION: &str = "s3.region";
    pub const S3_BUCKET: &str = "s3.bucket";
    pub const S3_ACCESS_KEY: &str = "s3.access_key";
    pub const S3_SECRET_KEY: &str = "s3.secret_key";
    pub const TUNNEL_ENABLED: &str = "tunnel.enabled";
    pub const TUNNEL_TOKEN: &str = "tunnel.token";
    pub const VAPID_PUBLIC: &str = "push.vapid_public";
    pub const VAPID_PRIVATE: &str = "push.vapid_private";
}

/// Values never returned verbatim to clients.
pub const SECRET_KEYS: &[&str] = &[
    keys::BACKUP_PASSPHRASE,
    keys::S3_SECRET_KEY,
    keys::TUNNEL_TOKEN,
    keys::VAPID_PRIVATE,
];

pub fn is_secret(key: &str) -> bool {
    SECRET_KEYS.contains(&key)
}

pub async fn get(pool: &SqlitePool, household_id: i64, key: &str) -> AppResult<Option<String>> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT value FROM settings WHERE household_id = ? AND key = ?")
            .bind(household_id)
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(value)
}

pub async fn get_bool(pool: &SqlitePool, household_id: i64, key: &str) -> AppResult<bool> {
    Ok(matches!(
        get(pool, household_id, key).await?.as_deref(),
        Some("true") | Some("1")
    ))
}

pub async fn get_i64(pool: &SqlitePool, household_id: i64, key: &str) -> AppResult<Option<i64>> {
    Ok(get(pool, household_id, key)
        .await?
        .and_then(|v| v.trim().parse().ok()))
}

/// Plain upsert without reload hooks, for subsystems writing their own keys.
pub async fn put(
    pool: &SqlitePool,
    household_id: i64,
    key: &str,
    value: &str,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO settings (household_id, key, value, updated_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT (household_id, key) DO UPDATE SET \
           value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(household_id)
    .bind(key)
    .bind(value)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn all(pool: &SqlitePool, household_id: i64) -> AppResult<HashMap<String, String>> {
    let rows = sqlx::query("SELECT key, value FROM settings WHERE household_id = ?")
        .bind(household_id)
        .fetch_all(pool)
        .await?;
    let mut out = HashMap::new();
    for row in rows {
        out.insert(row.try_get("key")?, row.try_get("value")?);
    }
    Ok(out)
}

pub type ReloadHook =
    Arc<dyn Fn(i64, String, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registry of reload hooks, shared between the settings routes and the
/// subsystems that react to writes (backup manager, tunnel supervisor).
#[derive(Clone, Default)]
pub struct SettingsService {
    hooks: Arc<RwLock<Vec<(String, ReloadHook)>>>,
}

impl SettingsService {
    pub fn new() -> Self {
        SettingsService::default()
    }

    /// Register a hook for keys starting with `prefix`. Hooks run in
    /// registration order.
    pub fn on_change(&self, prefix: impl Into<String>, hook: ReloadHook) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((prefix.into(), hook));
    }

    /// Upsert one key and run the matching hooks to completion.
    pub async fn set(
        &self,
        pool: &SqlitePool,
        household_id: i64,
        key: &str,
        value: &str,
    ) -> AppResult<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(AppError::validation("Setting key must not be empty"));
        }
        put(pool, household_id, key, value).await?;
        info!(target: "gamwich", household_id, key, secret = is_secret(key), "setting_updated");

        let matching: Vec<ReloadHook> = {
            let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
            hooks
                .iter()
                .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
                .map(|(_, hook)| hook.clone())
                .collect()
        };
        for hook in matching {
            hook(household_id, key.to_string(), value.to_string()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_migrations;
    use crate::store::household::create_household_with_admin;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;

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
    async fn set_then_get_round_trips_and_overwrites() {
        let (pool, hh) = fixture().await;
        let service = SettingsService::new();
        service.set(&pool, hh, keys::TUNNEL_ENABLED, "true").await.unwrap();
        assert!(get_bool(&pool, hh, keys::TUNNEL_ENABLED).await.unwrap());
        service.set(&pool, hh, keys::TUNNEL_ENABLED, "false").await.unwrap();
        assert!(!get_bool(&pool, hh, keys::TUNNEL_ENABLED).await.unwrap());
        assert_eq!(all(&pool, hh).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hooks_fire_for_matching_prefix_before_set_returns() {
        let (pool, hh) = fixture().await;
        let service = SettingsService::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        service.on_change(
            "tunnel.",
            Arc::new(move |_, key, value| {
                let log = log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("tunnel:{key}={value}"));
                })
            }),
        );
        let log = seen.clone();
        service.on_change(
            "backup.",
            Arc::new(move |_, key, _| {
                let log = log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("backup:{key}"));
                })
            }),
        );

        service.set(&pool, hh, keys::TUNNEL_TOKEN, "tok").await.unwrap();
        // The hook ran synchronously with respect to `set`.
        assert_eq!(seen.lock().unwrap().as_slice(), ["tunnel:tunnel.token=tok"]);

        service.set(&pool, hh, keys::BACKUP_ENABLED, "true").await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn secret_keys_are_flagged() {
        assert!(is_secret(keys::BACKUP_PASSPHRASE));
        assert!(is_secret(keys::TUNNEL_TOKEN));
        assert!(!is_secret(keys::TUNNEL_ENABLED));
    }
}
