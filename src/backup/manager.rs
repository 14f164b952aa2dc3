//! Encrypted backup pipeline and restore-and-swap.
//!
//! A backup run checkpoints the WAL, copies the database file, encrypts the
//! copy off the async runtime, and uploads it under
//! `{household}/backup-{timestamp}.db.enc`. Each run captures the storage
//! client once at the start; an admin swapping credentials mid-run cannot
//! leave half a backup on each endpoint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Timelike, Utc};
use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::backup::storage::{ObjectStorage, StorageConfig};
use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::hub::{BroadcastMessage, Hub};
use crate::store::backup_records::{self, BackupRecord, BackupStatus};
use crate::store::settings::{self, keys};
use crate::time::now_ms;

/// Completed backups older than this many days are pruned from storage
/// unless the household overrides `backup.retention_days`.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;
/// Scheduled backups run at this UTC hour unless overridden.
pub const DEFAULT_SCHEDULE_HOUR: i64 = 3;
/// Scheduler tick.
pub const SCHEDULE_INTERVAL_MS: u64 = 60_000;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub struct BackupManager {
    pool: Arc<RwLock<SqlitePool>>,
    db_path: PathBuf,
    storage: RwLock<Option<Arc<ObjectStorage>>>,
    hub: Hub,
    // Passphrases live only in process memory; the settings table carries
    // the salt, never the passphrase.
    passphrases: std::sync::RwLock<HashMap<i64, String>>,
    // Day number of the last scheduled run per household.
    last_scheduled: std::sync::Mutex<HashMap<i64, i64>>,
    // One backup at a time; the database copy is global state.
    run_lock: Mutex<()>,
}

impl BackupManager {
    pub fn new(pool: Arc<RwLock<SqlitePool>>, db_path: PathBuf, hub: Hub) -> Self {
        BackupManager {
            pool,
            db_path,
            storage: RwLock::new(None),
            hub,
            passphrases: std::sync::RwLock::new(HashMap::new()),
            last_scheduled: std::sync::Mutex::new(HashMap::new()),
            run_lock: Mutex::new(()),
        }
    }

    /// Seed the in-memory credential cache and persist a fresh salt. An
    /// empty passphrase clears the cache, which also stops scheduled runs.
    pub async fn set_passphrase(&self, household_id: i64, passphrase: &str) -> AppResult<()> {
        let pool = self.pool.read().await.clone();
        if passphrase.is_empty() {
            self.passphrases
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&household_id);
            settings::put(&pool, household_id, keys::BACKUP_SALT, "").await?;
            info!(target: "gamwich", household_id, "backup_passphrase_cleared");
            return Ok(());
        }
        let salt = crypto::generate_salt();
        let encoded = base64::engine::general_purpose::STANDARD.encode(salt);
        settings::put(&pool, household_id, keys::BACKUP_SALT, &encoded).await?;
        self.passphrases
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(household_id, passphrase.to_string());
        info!(target: "gamwich", household_id, "backup_passphrase_set");
        Ok(())
    }

    pub fn cached_passphrase(&self, household_id: i64) -> Option<String> {
        self.passphrases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&household_id)
            .cloned()
    }

    async fn stored_salt(
        pool: &SqlitePool,
        household_id: i64,
    ) -> AppResult<[u8; crypto::SALT_SIZE]> {
        let encoded = settings::get(pool, household_id, keys::BACKUP_SALT)
            .await?
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::new(
                    "DB_BACKUP/NO_PASSPHRASE",
                    "No backup passphrase has been set",
                )
            })?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(|_| AppError::new("DB_BACKUP/SALT", "Stored backup salt is unreadable"))?;
        bytes
            .try_into()
            .map_err(|_| AppError::new("DB_BACKUP/SALT", "Stored backup salt is unreadable"))
    }

    /// Replace the storage client. In-flight operations keep the Arc they
    /// captured; only new runs see the change.
    pub async fn configure(&self, config: Option<StorageConfig>) -> AppResult<()> {
        let client = match config {
            Some(ref cfg) if cfg.is_complete() => Some(Arc::new(ObjectStorage::new(cfg)?)),
            _ => None,
        };
        let configured = client.is_some();
        *self.storage.write().await = client;
        info!(target: "gamwich", configured, "backup_storage_configured");
        Ok(())
    }

    pub async fn storage_snapshot(&self) -> Option<Arc<ObjectStorage>> {
        self.storage.read().await.clone()
    }

    fn object_key(household_id: i64) -> String {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        format!("{household_id}/backup-{stamp}.db.enc")
    }

    fn broadcast_status(&self, record_id: i64, status: BackupStatus) {
        self.hub.broadcast(
            &BroadcastMessage::new("backups", "updated", record_id)
                .with_extra(serde_json::json!({ "status": status.as_str() })),
        );
    }

    /// Run one backup to completion. Missing preconditions (passphrase,
    /// salt, storage) fail the call before any record exists; once a record
    /// is created it walks pending -> uploading -> completed | failed, and
    /// a failure lands in its `error` column.
    pub async fn run_now(&self, household_id: i64, passphrase: &str) -> AppResult<BackupRecord> {
        let _guard = self.run_lock.lock().await;
        let pool = self.pool.read().await.clone();

        if passphrase.is_empty() {
            return Err(AppError::new(
                "DB_BACKUP/NO_PASSPHRASE",
                "No backup passphrase configured",
            ));
        }
        let salt = Self::stored_salt(&pool, household_id).await?;
        let storage = self
            .storage_snapshot()
            .await
            .ok_or_else(|| AppError::new("DB_BACKUP/NO_STORAGE", "No storage configured"))?;

        let record = backup_records::create_pending(&pool, household_id).await?;
        self.broadcast_status(record.id, BackupStatus::Pending);
        let key = Self::object_key(household_id);
        if let Err(err) = backup_records::mark_uploading(&pool, record.id, &key).await {
            // A colliding object key leaves no orphaned pending row.
            let _ = backup_records::delete(&pool, household_id, record.id).await;
            return Err(err);
        }
        self.broadcast_status(record.id, BackupStatus::Uploading);

        match self.execute(&pool, &storage, &key, passphrase, salt).await {
            Ok(size_bytes) => {
                backup_records::mark_completed(&pool, record.id, size_bytes).await?;
                info!(target: "gamwich", record_id = record.id, key = %key, bytes = size_bytes, "backup_completed");
                self.broadcast_status(record.id, BackupStatus::Completed);
            }
            Err(err) => {
                error!(target: "gamwich", record_id = record.id, error = %err, "backup_failed");
                if let Err(mark_err) =
                    backup_records::mark_failed(&pool, record.id, err.message()).await
                {
                    warn!(target: "gamwich", record_id = record.id, error = %mark_err, "backup_mark_failed");
                }
                self.broadcast_status(record.id, BackupStatus::Failed);
            }
        }

        backup_records::get(&pool, household_id, record.id)
            .await?
            .ok_or_else(|| AppError::not_found("Backup record"))
    }

    /// Snapshot, encrypt, upload. Returns the ciphertext size.
    async fn execute(
        &self,
        pool: &SqlitePool,
        storage: &ObjectStorage,
        key: &str,
        passphrase: &str,
        salt: [u8; crypto::SALT_SIZE],
    ) -> AppResult<i64> {
        // Fold the WAL into the main file so the copy is a full snapshot.
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(pool)
            .await?;

        let staging = tempfile::tempdir()?;
        let snapshot = staging.path().join("snapshot.db");
        tokio::fs::copy(&self.db_path, &snapshot).await?;
        let plaintext = tokio::fs::read(&snapshot).await?;

        let passphrase = passphrase.to_string();
        let ciphertext = tokio::task::spawn_blocking(move || {
            crypto::encrypt(&plaintext, &passphrase, &salt)
        })
        .await
        .map_err(|e| AppError::new("DB_BACKUP/TASK", e.to_string()))?
        .map_err(|e| AppError::new("DB_BACKUP/ENCRYPT", e.to_string()))?;

        storage.put(key, &ciphertext).await?;
        Ok(ciphertext.len() as i64)
    }

    /// Delete completed backups past retention, object first so a storage
    /// failure keeps the record for a later retry.
    pub async fn prune_old(&self, household_id: i64, retention_days: i64) -> AppResult<()> {
        let Some(storage) = self.storage_snapshot().await else {
            return Ok(());
        };
        let pool = self.pool.read().await.clone();
        let cutoff = now_ms() - retention_days * DAY_MS;
        for record in backup_records::completed_before(&pool, household_id, cutoff).await? {
            if let Some(key) = record.object_key.as_deref() {
                if let Err(err) = storage.delete(key).await {
                    warn!(target: "gamwich", record_id = record.id, error = %err, "backup_prune_delete");
                    continue;
                }
            }
            backup_records::delete(&pool, household_id, record.id).await?;
            info!(target: "gamwich", record_id = record.id, "backup_pruned");
        }
        Ok(())
    }

    /// Fetch a completed backup's ciphertext verbatim, for user export.
    /// Returns the object's file name and its bytes.
    pub async fn download(
        &self,
        household_id: i64,
        record_id: i64,
    ) -> AppResult<(String, Vec<u8>)> {
        let pool = self.pool.read().await.clone();
        let record = backup_records::get(&pool, household_id, record_id)
            .await?
            .ok_or_else(|| AppError::not_found("Backup record"))?;
        if record.status != BackupStatus::Completed {
            return Err(AppError::validation("Only completed backups can be downloaded"));
        }
        let key = record
            .object_key
            .ok_or_else(|| AppError::new("DB_BACKUP/NO_KEY", "Backup record has no object key"))?;
        let storage = self
            .storage_snapshot()
            .await
            .ok_or_else(|| AppError::new("DB_BACKUP/NO_STORAGE", "No storage configured"))?;
        let bytes = storage.get(&key).await?;
        let filename = key.rsplit('/').next().unwrap_or(&key).to_string();
        Ok((filename, bytes))
    }

    /// Download, decrypt, verify, and swap the database file into place.
    /// On success the caller is expected to terminate the process so it
    /// restarts against the restored file.
    pub async fn restore(
        &self,
        household_id: i64,
        record_id: i64,
        passphrase: &str,
    ) -> AppResult<()> {
        let _guard = self.run_lock.lock().await;
        let pool = self.pool.read().await.clone();
        let record = backup_records::get(&pool, household_id, record_id)
            .await?
            .ok_or_else(|| AppError::not_found("Backup record"))?;
        if record.status != BackupStatus::Completed {
            return Err(AppError::validation("Only completed backups can be restored"));
        }
        let key = record
            .object_key
            .ok_or_else(|| AppError::new("DB_RESTORE/NO_KEY", "Backup record has no object key"))?;
        let storage = self
            .storage_snapshot()
            .await
            .ok_or_else(|| AppError::new("DB_RESTORE/NO_STORAGE", "No storage configured"))?;

        let ciphertext = storage.get(&key).await?;
        let passphrase = passphrase.to_string();
        let plaintext = tokio::task::spawn_blocking(move || {
            crypto::decrypt(&ciphertext, &passphrase)
        })
        .await
        .map_err(|e| AppError::new("DB_RESTORE/TASK", e.to_string()))?
        .map_err(|e| {
            AppError::new("DB_RESTORE/DECRYPT", e.to_string())
                .with_context("record_id", record_id.to_string())
        })?;

        // Stage next to the live file so the final rename stays on one
        // filesystem.
        let parent = self
            .db_path
            .parent()
            .ok_or_else(|| AppError::new("DB_RESTORE/PATH", "Database path has no parent"))?;
        let incoming = parent.join(format!(".restore-{record_id}.db"));
        tokio::fs::write(&incoming, &plaintext).await?;

        let check_path = incoming.clone();
        tokio::task::spawn_blocking(move || verify_sqlite_integrity(&check_path))
            .await
            .map_err(|e| AppError::new("DB_RESTORE/TASK", e.to_string()))??;

        // Stop all queries, then swap under the write lock.
        let guard = self.pool.write().await;
        guard.close().await;
        swap_into_place(&incoming, &self.db_path)?;
        drop(guard);
        info!(target: "gamwich", record_id, "restore_swapped");
        Ok(())
    }

    /// Scheduler loop: a tick per minute, one backup per household per day
    /// at the configured UTC hour, retention pruning after each run.
    pub async fn run_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_millis(SCHEDULE_INTERVAL_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            if let Err(err) = self.scheduled_pass().await {
                warn!(target: "gamwich", error = %err, "backup_scheduler_pass");
            }
        }
    }

    async fn scheduled_pass(&self) -> AppResult<()> {
        self.scheduled_pass_at(Utc::now()).await
    }

    async fn scheduled_pass_at(&self, now: DateTime<Utc>) -> AppResult<()> {
        let pool = self.pool.read().await.clone();
        let today = now.timestamp_millis() / DAY_MS;
        for household_id in crate::store::household::all_household_ids(&pool).await? {
            if !settings::get_bool(&pool, household_id, keys::BACKUP_ENABLED).await? {
                continue;
            }
            let hour = settings::get_i64(&pool, household_id, keys::BACKUP_SCHEDULE_HOUR)
                .await?
                .unwrap_or(DEFAULT_SCHEDULE_HOUR);
            if i64::from(now.hour()) != hour {
                continue;
            }
            {
                let last = self.last_scheduled.lock().unwrap_or_else(|e| e.into_inner());
                if last.get(&household_id) == Some(&today) {
                    continue;
                }
            }
            // The passphrase is never persisted; only an admin saving it
            // this process lifetime arms the scheduler.
            let Some(passphrase) = self.cached_passphrase(household_id) else {
                warn!(target: "gamwich", household_id, "backup_skipped_no_passphrase");
                continue;
            };
            // The day is recorded only after a completed run, so a failure
            // is retried on the next tick instead of waiting out the day.
            match self.run_now(household_id, &passphrase).await {
                Ok(record) if record.status == BackupStatus::Completed => {
                    self.last_scheduled
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(household_id, today);
                }
                Ok(record) => {
                    warn!(target: "gamwich", household_id, record_id = record.id, "backup_scheduled_run_failed");
                }
                Err(err) => {
                    warn!(target: "gamwich", household_id, error = %err, "backup_scheduled_run");
                }
            }
            let retention = settings::get_i64(&pool, household_id, keys::BACKUP_RETENTION_DAYS)
                .await?
                .unwrap_or(DEFAULT_RETENTION_DAYS);
            if let Err(err) = self.prune_old(household_id, retention).await {
                warn!(target: "gamwich", household_id, error = %err, "backup_prune");
            }
        }
        Ok(())
    }
}

/// `PRAGMA integrity_check` on a candidate file, plus a sanity check that it
/// is a Gamwich database at all.
pub fn verify_sqlite_integrity(path: &Path) -> AppResult<()> {
    let conn = rusqlite::Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .map_err(|e| AppError::new("DB_RESTORE/OPEN", e.to_string()))?;

    let verdict: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| AppError::new("DB_RESTORE/INTEGRITY", e.to_string()))?;
    if verdict != "ok" {
        return Err(AppError::new("DB_RESTORE/INTEGRITY", verdict));
    }

    let has_schema: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'households'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| AppError::new("DB_RESTORE/INTEGRITY", e.to_string()))?;
    if has_schema == 0 {
        return Err(AppError::new(
            "DB_RESTORE/SCHEMA",
            "Restored file is not a recognizable database",
        ));
    }
    Ok(())
}

/// Same-parent rename over the live file, dropping stale WAL/SHM sidecars
/// first so SQLite cannot pair the restored file with old journal state.
pub fn swap_into_place(incoming: &Path, live: &Path) -> std::io::Result<()> {
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = live.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = PathBuf::from(sidecar);
        if sidecar.exists() {
            std::fs::remove_file(&sidecar)?;
        }
    }
    std::fs::rename(incoming, live)
}
