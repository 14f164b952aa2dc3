use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::backup::BackupManager;
use crate::config::Config;
use crate::hub::Hub;
use crate::mailer::Mailer;
use crate::push::PushService;
use crate::rate_limit::RateLimiter;
use crate::store::settings::SettingsService;
use crate::tunnel::TunnelSupervisor;

/// Shared handles for the router and background tasks. The pool sits behind
/// a lock because a restore closes it and swaps the file underneath.
#[derive(Clone)]
pub struct AppState {
    pool: Arc<RwLock<SqlitePool>>,
    pub config: Arc<Config>,
    pub hub: Hub,
    pub rate_limiter: Arc<RateLimiter>,
    pub backups: Arc<BackupManager>,
    pub tunnel: Arc<TunnelSupervisor>,
    pub settings: SettingsService,
    pub mailer: Arc<Mailer>,
    pub push: Arc<PushService>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<RwLock<SqlitePool>>,
        config: Arc<Config>,
        hub: Hub,
        backups: Arc<BackupManager>,
        tunnel: Arc<TunnelSupervisor>,
        settings: SettingsService,
        mailer: Arc<Mailer>,
        push: Arc<PushService>,
    ) -> Self {
        AppState {
            pool,
            config,
            hub,
            rate_limiter: Arc::new(RateLimiter::new()),
            backups,
            tunnel,
            settings,
            mailer,
            push,
        }
    }

    pub async fn pool_clone(&self) -> SqlitePool {
        self.pool.read().await.clone()
    }

    pub fn pool_handle(&self) -> Arc<RwLock<SqlitePool>> {
        self.pool.clone()
    }
}
