//! WebSocket endpoint feeding hub broadcasts to connected clients.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::Response;
use tracing::debug;

use crate::auth::AuthContext;
use crate::hub::{Hub, KEEPALIVE_INTERVAL_SECS};
use crate::state::AppState;

pub async fn upgrade(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ws: WebSocketUpgrade,
) -> Response {
    debug!(target: "gamwich", user_id = ctx.user_id, "ws_connect");
    ws.on_upgrade(move |socket| serve(socket, state.hub.clone()))
}

async fn serve(mut socket: WebSocket, hub: Hub) {
    let mut subscription = hub.register();
    let mut keepalive = tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
    keepalive.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            outbound = subscription.rx.recv() => {
                // `None` means the hub dropped us for falling behind.
                let Some(msg) = outbound else { break };
                let Ok(text) = serde_json::to_string(&msg) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = keepalive.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    // Clients only ever listen; anything else is ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    subscription.unregister();
    debug!(target: "gamwich", subscriber = subscription.id, "ws_disconnect");
}
