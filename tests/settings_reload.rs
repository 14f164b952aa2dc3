//! Settings writes must reconfigure their subsystem before `set` returns.

use std::sync::Arc;

use anyhow::Result;
use gamwich_lib::store::settings::{self, keys, SettingsService};
use gamwich_lib::tunnel::{TunnelConfig, TunnelState, TunnelSupervisor};
use sqlx::SqlitePool;

#[path = "util.rs"]
mod util;

fn supervisor() -> Arc<TunnelSupervisor> {
    Arc::new(TunnelSupervisor::new(
        TunnelConfig::default(),
        Arc::new(|_| {}),
    ))
}

fn wire(service: &SettingsService, pool: SqlitePool, tunnel: Arc<TunnelSupervisor>) {
    service.on_change(
        "tunnel.",
        Arc::new(move |household_id, _key, _value| {
            let pool = pool.clone();
            let tunnel = tunnel.clone();
            Box::pin(async move {
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
        }),
    );
}

#[tokio::test]
async fn tunnel_settings_apply_before_the_write_returns() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (hh, _) = util::seed_household(&pool).await?;
    let tunnel = supervisor();
    let service = SettingsService::new();
    wire(&service, pool.clone(), tunnel.clone());

    assert_eq!(tunnel.state(), TunnelState::Disabled);

    // A token without enablement parks the tunnel in Stopped.
    service.set(&pool, hh.id, keys::TUNNEL_TOKEN, "ey-token").await?;
    assert_eq!(tunnel.state(), TunnelState::Stopped);

    // Clearing the token disables it again.
    service.set(&pool, hh.id, keys::TUNNEL_TOKEN, "").await?;
    assert_eq!(tunnel.state(), TunnelState::Disabled);
    Ok(())
}

#[tokio::test]
async fn unrelated_prefixes_do_not_touch_the_tunnel() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (hh, _) = util::seed_household(&pool).await?;
    let tunnel = supervisor();
    let service = SettingsService::new();
    wire(&service, pool.clone(), tunnel.clone());

    service.set(&pool, hh.id, keys::BACKUP_ENABLED, "true").await?;
    service.set(&pool, hh.id, keys::BACKUP_RETENTION_DAYS, "45").await?;
    assert_eq!(tunnel.state(), TunnelState::Disabled);

    assert!(settings::get_bool(&pool, hh.id, keys::BACKUP_ENABLED).await?);
    Ok(())
}
