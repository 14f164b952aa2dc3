//! HTTP surface: REST handlers, the WebSocket upgrade, and router assembly.

pub mod auth;
pub mod backups;
pub mod chores;
pub mod events;
pub mod grocery;
pub mod notes;
pub mod push_api;
pub mod rewards;
pub mod settings_api;
pub mod ws;

use axum::extract::State;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};

use crate::auth::middleware::{require_admin, require_session};
use crate::state::AppState;

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let db_ok = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.pool_clone().await)
        .await
        .is_ok();
    Json(health_body(db_ok))
}

fn health_body(db_ok: bool) -> serde_json::Value {
    let status = if db_ok { "ok" } else { "degraded" };
    serde_json::json!({ "status": status })
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/request-code", post(auth::request_code))
        .route("/api/auth/verify", post(auth::verify))
        .route("/invite/accept", get(auth::invite_accept));

    let admin = Router::new()
        .route("/api/households/invite", post(auth::invite))
        .route("/api/settings", get(settings_api::list).put(settings_api::set))
        .route("/api/backups", get(backups::list))
        .route("/api/backups/run", post(backups::run))
        .route("/api/backups/{id}/download", get(backups::download))
        .route("/api/backups/{id}/restore", post(backups::restore))
        .route_layer(middleware::from_fn(require_admin));

    let protected = Router::new()
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/switch", post(auth::switch))
        .route("/api/households/members", get(auth::members))
        .route("/api/calendar", get(events::calendar))
        .route("/api/events", post(events::create))
        .route(
            "/api/events/{id}",
            get(events::get_one).put(events::update).delete(events::remove),
        )
        .route("/api/events/{id}/exceptions", put(events::upsert_exception))
        .route(
            "/api/events/{id}/exceptions/{original_start}",
            delete(events::remove_exception),
        )
        .route("/api/chores", get(chores::list).post(chores::create))
        .route(
            "/api/chores/{id}",
            put(chores::update).delete(chores::remove),
        )
        .route("/api/chores/{id}/complete", post(chores::complete))
        .route("/api/points", get(chores::points))
        .route("/api/grocery", get(grocery::list).post(grocery::create))
        .route(
            "/api/grocery/{id}",
            put(grocery::set_checked).delete(grocery::remove),
        )
        .route("/api/grocery/clear-checked", post(grocery::clear_checked))
        .route("/api/notes", get(notes::list).post(notes::create))
        .route(
            "/api/notes/{id}",
            put(notes::update).delete(notes::remove),
        )
        .route("/api/rewards", get(rewards::list).post(rewards::create))
        .route("/api/rewards/{id}", delete(rewards::remove))
        .route("/api/rewards/{id}/redeem", post(rewards::redeem))
        .route("/api/push/vapid-key", get(push_api::vapid_key))
        .route(
            "/api/push/subscription",
            post(push_api::subscribe).delete(push_api::unsubscribe),
        )
        .route(
            "/api/push/preferences",
            get(push_api::get_preferences).put(push_api::set_preferences),
        )
        .route("/api/tunnel/status", get(tunnel_status))
        .route("/ws", get(ws::upgrade))
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    public.merge(protected).with_state(state)
}

async fn tunnel_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.tunnel.state()).unwrap_or_default())
}
