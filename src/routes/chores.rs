use axum::extract::{Extension, Path, State};
use axum::Json;

use crate::auth::AuthContext;
use crate::error::AppResult;
use crate::hub::BroadcastMessage;
use crate::state::AppState;
use crate::store::chores::{self, Chore, ChoreInput};

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<Vec<Chore>>> {
    let pool = state.pool_clone().await;
    Ok(Json(chores::list(&pool, ctx.household_id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(input): Json<ChoreInput>,
) -> AppResult<Json<Chore>> {
    let pool = state.pool_clone().await;
    let chore = chores::create(&pool, ctx.household_id, &input).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("chores", "created", chore.id));
    Ok(Json(chore))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
    Json(input): Json<ChoreInput>,
) -> AppResult<Json<Chore>> {
    let pool = state.pool_clone().await;
    let chore = chores::update(&pool, ctx.household_id, id, &input).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("chores", "updated", id));
    Ok(Json(chore))
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = state.pool_clone().await;
    chores::delete(&pool, ctx.household_id, id).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("chores", "deleted", id));
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn complete(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> AppResult<Json<Chore>> {
    let pool = state.pool_clone().await;
    let chore = chores::complete(&pool, ctx.household_id, id, ctx.user_id).await?;
    state.hub.broadcast(
        &BroadcastMessage::new("chores", "updated", id)
            .with_extra(serde_json::json!({ "completed_by": ctx.user_id })),
    );
    Ok(Json(chore))
}

pub async fn points(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = state.pool_clone().await;
    let balance = chores::point_balance(&pool, ctx.user_id).await?;
    Ok(Json(serde_json::json!({ "balance": balance })))
}
