use std::collections::HashMap;

use axum::extract::{Extension, State};
use axum::Json;
use serde::Deserialize;

use crate::auth::AuthContext;
use crate::error::AppResult;
use crate::state::AppState;
use crate::store::settings;

const MASKED: &str = "********";

/// Settings listing with secret values masked. A masked value still tells
/// the admin the secret is set.
pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<HashMap<String, String>>> {
    let pool = state.pool_clone().await;
    let mut all = settings::all(&pool, ctx.household_id).await?;
    for (key, value) in all.iter_mut() {
        if settings::is_secret(key) && !value.is_empty() {
            *value = MASKED.to_string();
        }
    }
    Ok(Json(all))
}

#[derive(Deserialize)]
pub struct SetBody {
    pub key: String,
    pub value: String,
}

pub async fn set(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<SetBody>,
) -> AppResult<Json<serde_json::Value>> {
    // The passphrase never lands in the settings table; it seeds the
    // backup manager's in-memory cache and persists only a salt.
    if body.key == settings::keys::BACKUP_PASSPHRASE {
        state
            .backups
            .set_passphrase(ctx.household_id, &body.value)
            .await?;
        return Ok(Json(serde_json::json!({ "ok": true })));
    }
    let pool = state.pool_clone().await;
    state
        .settings
        .set(&pool, ctx.household_id, &body.key, &body.value)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
