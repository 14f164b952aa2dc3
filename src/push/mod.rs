pub mod service;
pub mod vapid;

pub use service::{PushService, PUSH_FANOUT_PERMITS, TICK_INTERVAL_MS};
pub use vapid::VapidKeys;
