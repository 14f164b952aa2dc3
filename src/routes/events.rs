use axum::extract::{Extension, Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::auth::AuthContext;
use crate::error::{AppError, AppResult};
use crate::hub::BroadcastMessage;
use crate::state::AppState;
use crate::store::events::{self, CalendarEntry, Event, EventInput};

#[derive(Deserialize)]
pub struct WindowQuery {
    pub from: i64,
    pub to: i64,
}

pub async fn calendar(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(window): Query<WindowQuery>,
) -> AppResult<Json<Vec<CalendarEntry>>> {
    let pool = state.pool_clone().await;
    let entries = events::list_window(&pool, ctx.household_id, window.from, window.to).await?;
    Ok(Json(entries))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(input): Json<EventInput>,
) -> AppResult<Json<Event>> {
    let pool = state.pool_clone().await;
    let event = events::create(&pool, ctx.household_id, ctx.user_id, &input).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("events", "created", event.id));
    Ok(Json(event))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> AppResult<Json<Event>> {
    let pool = state.pool_clone().await;
    let event = events::get(&pool, ctx.household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Event"))?;
    Ok(Json(event))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
    Json(input): Json<EventInput>,
) -> AppResult<Json<Event>> {
    let pool = state.pool_clone().await;
    let event = events::update(&pool, ctx.household_id, id, &input).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("events", "updated", id));
    Ok(Json(event))
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = state.pool_clone().await;
    events::delete(&pool, ctx.household_id, id).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("events", "deleted", id));
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct ExceptionBody {
    pub original_start: i64,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_at: Option<i64>,
    #[serde(default)]
    pub end_at: Option<i64>,
}

pub async fn upsert_exception(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
    Json(body): Json<ExceptionBody>,
) -> AppResult<Json<events::EventException>> {
    let pool = state.pool_clone().await;
    let exception = events::upsert_exception(
        &pool,
        ctx.household_id,
        id,
        body.original_start,
        body.cancelled,
        body.title.as_deref(),
        body.description.as_deref(),
        body.start_at,
        body.end_at,
    )
    .await?;
    state.hub.broadcast(
        &BroadcastMessage::new("events", "updated", id)
            .with_extra(serde_json::json!({ "original_start": body.original_start })),
    );
    Ok(Json(exception))
}

pub async fn remove_exception(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path((id, original_start)): Path<(i64, i64)>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = state.pool_clone().await;
    events::delete_exception(&pool, ctx.household_id, id, original_start).await?;
    state
        .hub
        .broadcast(&BroadcastMessage::new("events", "updated", id));
    Ok(Json(serde_json::json!({ "ok": true })))
}
