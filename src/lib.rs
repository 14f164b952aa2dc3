//! Gamwich is a self-hosted family organizer: one binary, one SQLite file,
//! a handful of background tasks. This crate exposes the full server so the
//! binary in `main.rs` stays a thin CLI shell.

pub mod auth;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod error;
pub mod hub;
pub mod logging;
pub mod mailer;
pub mod migrate;
pub mod push;
pub mod rate_limit;
pub mod recurrence;
pub mod routes;
pub mod state;
pub mod store;
pub mod time;
pub mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::backup::{BackupManager, StorageConfig};
use crate::config::Config;
use crate::hub::{BroadcastMessage, Hub};
use crate::mailer::Mailer;
use crate::push::PushService;
use crate::state::AppState;
use crate::store::settings::{self, keys, ReloadHook, SettingsService};
use crate::tunnel::{TunnelConfig, TunnelSupervisor};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

pub async fn open_pool(config: &Config) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("open database at {}", config.db_path.display()))?;
    Ok(pool)
}

/// Bring up the whole server: pool, migrations, background schedulers, and
/// the HTTP listener. Returns when a shutdown signal has been handled.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let pool = open_pool(&config).await?;
    migrate::apply_migrations(&pool).await?;
    let pool = Arc::new(RwLock::new(pool));

    let hub = Hub::new();
    let backups = Arc::new(BackupManager::new(
        pool.clone(),
        config.db_path.clone(),
        hub.clone(),
    ));
    let storage_config = initial_storage_config(&*pool.read().await, &config.s3).await;
    if let Err(err) = backups.configure(Some(storage_config)).await {
        warn!(target: "gamwich", error = %err, "backup_storage_unconfigured");
    }

    let tunnel = Arc::new(TunnelSupervisor::new(
        initial_tunnel_config(&*pool.read().await).await,
        tunnel_callback(hub.clone()),
    ));
    tunnel.start();

    let settings_service = SettingsService::new();
    settings_service.on_change("tunnel.", tunnel_reload_hook(pool.clone(), tunnel.clone()));
    settings_service.on_change(
        "s3.",
        storage_reload_hook(pool.clone(), backups.clone(), config.clone()),
    );

    let mailer = Arc::new(Mailer::new(&config));
    let push = Arc::new(PushService::new(pool.clone(), config.clone()));

    let state = AppState::new(
        pool.clone(),
        config.clone(),
        hub,
        backups.clone(),
        tunnel.clone(),
        settings_service,
        mailer,
        push.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let backup_task = tokio::spawn(backups.clone().run_scheduler(shutdown_rx.clone()));
    let push_task = tokio::spawn(push.clone().run_scheduler(shutdown_rx.clone()));
    let maintenance_task = tokio::spawn(maintenance_loop(state.clone(), shutdown_rx));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(target: "gamwich", %addr, "server_listening");

    axum::serve(
        listener,
        routes::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("http server")?;

    // Shutdown order: the tunnel child first, then the background tasks.
    info!(target: "gamwich", "server_draining");
    tunnel.stop().await;
    let _ = shutdown_tx.send(true);
    for task in [backup_task, push_task, maintenance_task] {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
    info!(target: "gamwich", "server_stopped");
    Ok(())
}

/// The tunnel token and enablement live in the first household's settings;
/// a single-household install is the supported deployment.
async fn initial_tunnel_config(pool: &SqlitePool) -> TunnelConfig {
    let Ok(ids) = store::household::all_household_ids(pool).await else {
        return TunnelConfig::default();
    };
    let Some(&household_id) = ids.first() else {
        return TunnelConfig::default();
    };
    let enabled = settings::get_bool(pool, household_id, keys::TUNNEL_ENABLED)
        .await
        .unwrap_or(false);
    let token = settings::get(pool, household_id, keys::TUNNEL_TOKEN)
        .await
        .ok()
        .flatten()
        .unwrap_or_default();
    TunnelConfig { enabled, token }
}

/// Persisted S3 settings override the environment; before any household
/// exists the environment is all there is.
async fn initial_storage_config(pool: &SqlitePool, env: &config::S3Env) -> StorageConfig {
    let first = store::household::all_household_ids(pool)
        .await
        .ok()
        .and_then(|ids| ids.first().copied());
    match first {
        Some(household_id) => StorageConfig::resolve(pool, household_id, env)
            .await
            .unwrap_or_else(|_| StorageConfig::from_env(env)),
        None => StorageConfig::from_env(env),
    }
}

/// Any `s3.` write rebuilds the whole storage config so a half-edited
/// credential set degrades to Disabled instead of mixing old and new.
fn storage_reload_hook(
    pool: Arc<RwLock<SqlitePool>>,
    backups: Arc<BackupManager>,
    config: Arc<Config>,
) -> ReloadHook {
    Arc::new(move |household_id, _key, _value| {
        let pool = pool.clone();
        let backups = backups.clone();
        let config = config.clone();
        Box::pin(async move {
            let pool = pool.read().await.clone();
            match StorageConfig::resolve(&pool, household_id, &config.s3).await {
                Ok(storage) => {
                    if let Err(err) = backups.configure(Some(storage)).await {
                        warn!(target: "gamwich", error = %err, "backup_storage_reconfigure");
                    }
                }
                Err(err) => {
                    warn!(target: "gamwich", error = %err, "backup_storage_reload_read");
                }
            }
        })
    })
}

fn tunnel_callback(hub: Hub) -> tunnel::StatusCallback {
    Arc::new(move |state| {
        if let Ok(extra) = serde_json::to_value(state) {
            hub.broadcast(&BroadcastMessage::new("tunnel", "updated", 0).with_extra(extra));
        }
    })
}

/// Re-reads both tunnel keys on any `tunnel.` write so enabling, disabling,
/// and token rotation all converge on the same restart path.
fn tunnel_reload_hook(
    pool: Arc<RwLock<SqlitePool>>,
    tunnel: Arc<TunnelSupervisor>,
) -> ReloadHook {
    Arc::new(move |household_id, _key, _value| {
        let pool = pool.clone();
        let tunnel = tunnel.clone();
        Box::pin(async move {
            let pool = pool.read().await.clone();
            let enabled = settings::get_bool(&pool, household_id, keys::TUNNEL_ENABLED)
                .await
                .unwrap_or(false);
            let token = settings::get(&pool, household_id, keys::TUNNEL_TOKEN)
                .await
                .ok()
                .flatten()
                .unwrap_or_default();
            tunnel.update_config(TunnelConfig { enabled, token }).await;
        })
    })
}

/// Hourly housekeeping: expired sessions and login codes, idle rate-limit
/// buckets.
async fn maintenance_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
    tick.tick().await;
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
        let pool = state.pool_clone().await;
        if let Err(err) = auth::session::gc_expired(&pool).await {
            warn!(target: "gamwich", error = %err, "session_gc_failed");
        }
        if let Err(err) = auth::codes::gc_expired(&pool).await {
            warn!(target: "gamwich", error = %err, "code_gc_failed");
        }
        state.rate_limiter.prune();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(target: "gamwich", "shutdown_signal");
}
