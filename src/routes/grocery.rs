use axum::extract::{Extension, Path, State};
use axum::Json;
use serde::Deserialize;

use crate::auth::AuthContext;
use crate::error::AppResult;
use crate::hub::BroadcastMessage;
use crate::state::AppState;
use crate::store::grocery::{self, GroceryInput, GroceryItem};

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<Vec<GroceryItem>>> {
    let pool = state.pool_clone().await;
    Ok(Json(grocery::list(&pool, ctx.household_id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(input): Json<GroceryInput>,
) -> AppResult<Json<GroceryItem>> {
    let pool = state.pool_clone().await;
    let item = grocery::create(&pool, ctx.household_id, ctx.user_id, &input).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("grocery_items", "created", item.id));

    // Best-effort; does not hold up the response.
    let push = state.push.clone();
    let household_id = ctx.household_id;
    let actor = ctx.user_id;
    let item_id = item.id;
    let name = item.name.clone();
    tokio::spawn(async move {
        push.notify_grocery_added(household_id, actor, item_id, &name)
            .await;
    });
    Ok(Json(item))
}

#[derive(Deserialize)]
pub struct CheckedBody {
    pub checked: bool,
}

pub async fn set_checked(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
    Json(body): Json<CheckedBody>,
) -> AppResult<Json<GroceryItem>> {
    let pool = state.pool_clone().await;
    let item = grocery::set_checked(&pool, ctx.household_id, id, body.checked).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("grocery_items", "updated", id));
    Ok(Json(item))
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = state.pool_clone().await;
    grocery::delete(&pool, ctx.household_id, id).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("grocery_items", "deleted", id));
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn clear_checked(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = state.pool_clone().await;
    let removed = grocery::clear_checked(&pool, ctx.household_id).await?;
    for id in &removed {
        state
            .hub
            .broadcast(&BroadcastMessage::new("grocery_items", "deleted", *id));
    }
    Ok(Json(serde_json::json!({ "removed": removed })))
}
