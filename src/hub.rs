//! WebSocket broadcast hub.
//!
//! Every mutating handler publishes a small typed message; each connected
//! client owns one writer task that drains a bounded queue. A subscriber
//! whose queue is full is dropped on the spot, so publishers never block and
//! healthy clients keep their ordering guarantee.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound queue depth per subscriber. A kiosk that cannot drain 16
/// messages is effectively dead and gets disconnected.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 16;

/// Interval between keep-alive pings written by each subscriber's writer.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Wire shape: `{"type": entity, "action": verb, "id": n, "extra"?: {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub entity: String,
    pub action: String,
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl BroadcastMessage {
    pub fn new(entity: impl Into<String>, action: impl Into<String>, id: i64) -> Self {
        BroadcastMessage {
            entity: entity.into(),
            action: action.into(),
            id,
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Handle held by a subscriber's writer task; dropping the receiver (or the
/// hub closing the sender) ends the writer.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<BroadcastMessage>,
    hub: Hub,
}

impl Subscription {
    /// Remove this subscriber from the registry. Idempotent; also called by
    /// `Drop` so a writer exiting on transport error cleans up after itself.
    pub fn unregister(&self) {
        self.hub.unregister(self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<BroadcastMessage>>>,
}

impl Hub {
    pub fn new() -> Self {
        Hub::default()
    }

    /// Register a new subscriber and hand back its queue.
    pub fn register(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        debug!(target: "gamwich", subscriber = id, "hub_register");
        Subscription {
            id,
            rx,
            hub: self.clone(),
        }
    }

    pub fn unregister(&self, id: u64) {
        let removed = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            debug!(target: "gamwich", subscriber = id, "hub_unregister");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Enqueue `msg` to every subscriber. A full queue drops the subscriber:
    /// its sender is removed so the writer's `recv` returns `None` and the
    /// task exits. The read lock is released before any channel interaction
    /// beyond `try_send`, which never blocks.
    pub fn broadcast(&self, msg: &BroadcastMessage) {
        let mut dropped: Vec<u64> = Vec::new();
        {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(|e| e.into_inner());
            for (id, tx) in subscribers.iter() {
                match tx.try_send(msg.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => dropped.push(*id),
                    Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
                }
            }
        }
        for id in dropped {
            warn!(target: "gamwich", subscriber = id, "hub_drop_slow_subscriber");
            self.unregister(id);
        }
    }
}
