use axum::extract::{Extension, Path, State};
use axum::Json;

use crate::auth::AuthContext;
use crate::error::AppResult;
use crate::hub::BroadcastMessage;
use crate::state::AppState;
use crate::store::notes::{self, Note, NoteInput};

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> AppResult<Json<Vec<Note>>> {
    let pool = state.pool_clone().await;
    Ok(Json(notes::list(&pool, ctx.household_id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(input): Json<NoteInput>,
) -> AppResult<Json<Note>> {
    let pool = state.pool_clone().await;
    let note = notes::create(&pool, ctx.household_id, ctx.user_id, &input).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("notes", "created", note.id));
    Ok(Json(note))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
    Json(input): Json<NoteInput>,
) -> AppResult<Json<Note>> {
    let pool = state.pool_clone().await;
    let note = notes::update(&pool, ctx.household_id, id, &input).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("notes", "updated", id));
    Ok(Json(note))
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = state.pool_clone().await;
    notes::delete(&pool, ctx.household_id, id).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("notes", "deleted", id));
    Ok(Json(serde_json::json!({ "ok": true })))
}
