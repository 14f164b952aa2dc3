use axum::extract::{Extension, State};
use axum::Json;
use serde::Deserialize;

use crate::auth::AuthContext;
use crate::error::AppResult;
use crate::push::vapid;
use crate::state::AppState;
use crate::store::push::{self, Preferences, PushSubscription, SubscriptionInput};

/// Public VAPID key for the browser's `pushManager.subscribe` call.
pub async fn vapid_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = state.pool_clone().await;
    let keys = vapid::load_or_create(&pool, ctx.household_id, &state.config).await?;
    Ok(Json(serde_json::json!({ "public_key": keys.public })))
}

pub async fn subscribe(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(input): Json<SubscriptionInput>,
) -> AppResult<Json<PushSubscription>> {
    let pool = state.pool_clone().await;
    let sub = push::upsert_subscription(&pool, ctx.user_id, ctx.household_id, &input).await?;
    Ok(Json(sub))
}

#[derive(Deserialize)]
pub struct UnsubscribeBody {
    pub endpoint: String,
}

pub async fn unsubscribe(
    State(state): State<AppState>,
    Json(body): Json<UnsubscribeBody>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = state.pool_clone().await;
    let removed = push::delete_by_endpoint(&pool, &body.endpoint).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

pub async fn get_preferences(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<Preferences>> {
    let pool = state.pool_clone().await;
    Ok(Json(push::preferences(&pool, ctx.user_id).await?))
}

pub async fn set_preferences(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(prefs): Json<Preferences>,
) -> AppResult<Json<Preferences>> {
    let pool = state.pool_clone().await;
    push::set_preferences(&pool, ctx.user_id, &prefs).await?;
    Ok(Json(prefs))
}
