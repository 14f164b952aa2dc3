use axum::extract::{Extension, Path, State};
use axum::Json;

use crate::auth::AuthContext;
use crate::error::AppResult;
use crate::hub::BroadcastMessage;
use crate::state::AppState;
use crate::store::rewards::{self, Redemption, Reward, RewardInput};

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<Vec<Reward>>> {
    let pool = state.pool_clone().await;
    Ok(Json(rewards::list(&pool, ctx.household_id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(input): Json<RewardInput>,
) -> AppResult<Json<Reward>> {
    let pool = state.pool_clone().await;
    let reward = rewards::create(&pool, ctx.household_id, &input).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("rewards", "created", reward.id));
    Ok(Json(reward))
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = state.pool_clone().await;
    rewards::delete(&pool, ctx.household_id, id).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("rewards", "deleted", id));
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn redeem(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> AppResult<Json<Redemption>> {
    let pool = state.pool_clone().await;
    let redemption = rewards::redeem(&pool, ctx.household_id, id, ctx.user_id).await?;
    state.hub.broadcast(
        &BroadcastMessage::new("rewards", "updated", id)
            .with_extra(serde_json::json!({ "redeemed_by": ctx.user_id })),
    );
    Ok(Json(redemption))
}
