//! Admin backup endpoints. A successful restore answers the request and
//! then exits the process so the supervisor restarts it on the swapped
//! database file.

use std::time::Duration;

use axum::extract::{Extension, Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::auth::AuthContext;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::store::backup_records::{self, BackupRecord};

const LIST_LIMIT: i64 = 50;

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<Vec<BackupRecord>>> {
    let pool = state.pool_clone().await;
    Ok(Json(
        backup_records::list(&pool, ctx.household_id, LIST_LIMIT).await?,
    ))
}

fn cached_passphrase(state: &AppState, household_id: i64) -> AppResult<String> {
    state.backups.cached_passphrase(household_id).ok_or_else(|| {
        AppError::validation("Save the backup passphrase in settings before running backups")
    })
}

pub async fn run(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<BackupRecord>> {
    let passphrase = cached_passphrase(&state, ctx.household_id)?;
    let record = state.backups.run_now(ctx.household_id, &passphrase).await?;
    Ok(Json(record))
}

pub async fn download(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse> {
    let (filename, bytes) = state.backups.download(ctx.household_id, id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    ))
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct RestoreBody {
    pub passphrase: Option<String>,
}

pub async fn restore(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
    Json(body): Json<RestoreBody>,
) -> AppResult<Json<serde_json::Value>> {
    // After a crash or on a fresh install the cache is empty, so the
    // restore form can always supply the passphrase explicitly.
    let passphrase = match body.passphrase.filter(|p| !p.is_empty()) {
        Some(p) => p,
        None => cached_passphrase(&state, ctx.household_id)?,
    };
    state
        .backups
        .restore(ctx.household_id, id, &passphrase)
        .await?;
    info!(target: "gamwich", record_id = id, "restore_complete_restarting");

    // Give the response a moment to flush, then hand control back to the
    // process supervisor.
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(250)).await;
        std::process::exit(0);
    });
    Ok(Json(serde_json::json!({ "ok": true, "restarting": true })))
}
