use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber once. `LOG_LEVEL` (then `RUST_LOG`) feeds
/// the env filter; default is `info` with noisy deps quieted.
pub fn init() {
    INITIALIZED.get_or_init(|| {
        let directive = std::env::var("LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info,sqlx=warn,hyper=warn,rustls=warn".to_string());
        let filter = EnvFilter::try_new(&directive)
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
