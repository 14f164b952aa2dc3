//! Supervised outbound HTTPS tunnel subprocess.
//!
//! The supervisor owns a long-running `cloudflared` child, parses its stderr
//! stream into connection events, and restarts it with exponential backoff.
//! Log parsing is a pure per-line function so the state machine is testable
//! without spawning a real process.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const TUNNEL_BINARY: &str = "cloudflared";
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const MAX_CONSECUTIVE_FAILURES: u32 = 10;
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelState {
    /// No token configured.
    Disabled,
    /// Token present but the tunnel is not enabled or not started.
    Stopped,
    Connecting,
    Connected {
        #[serde(skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
    },
    Reconnecting,
    /// Too many consecutive failures; terminal until reconfigured.
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TunnelConfig {
    pub enabled: bool,
    pub token: String,
}

/// One parsed stderr line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Connected { hostname: Option<String> },
    Reconnecting,
    Ignored,
}

/// Translate a single stderr line into a connection event.
pub fn parse_line(line: &str) -> LogEvent {
    if let Some(hostname) = extract_hostname(line) {
        return LogEvent::Connected {
            hostname: Some(hostname),
        };
    }
    let lower = line.to_ascii_lowercase();
    if lower.contains("registered tunnel connection")
        || lower.contains("connection established")
    {
        return LogEvent::Connected { hostname: None };
    }
    if lower.contains("retrying connection")
        || lower.contains("unregistered tunnel connection")
        || lower.contains("failed to connect")
        || lower.contains("connection terminated")
    {
        return LogEvent::Reconnecting;
    }
    LogEvent::Ignored
}

fn extract_hostname(line: &str) -> Option<String> {
    let idx = line.find("https://")?;
    let rest = &line[idx + "https://".len()..];
    let host: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .collect();
    if host.ends_with(".trycloudflare.com") || host.ends_with(".cfargotunnel.com") {
        Some(host)
    } else {
        None
    }
}

pub type StatusCallback = Arc<dyn Fn(&TunnelState) + Send + Sync>;

pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: Mutex<TunnelConfig>,
    state: Mutex<TunnelState>,
    callback: StatusCallback,
    running: AtomicBool,
    monitor: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl TunnelSupervisor {
    pub fn new(config: TunnelConfig, callback: StatusCallback) -> Self {
        let state = if config.token.is_empty() {
            TunnelState::Disabled
        } else {
            TunnelState::Stopped
        };
        TunnelSupervisor {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                state: Mutex::new(state),
                callback,
                running: AtomicBool::new(false),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Spawn the monitor task. No-op when already running, disabled, or
    /// missing a token. A missing binary is reported as `Error`.
    pub fn start(&self) {
        let config = self
            .inner
            .config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if config.token.is_empty() {
            Inner::set_state(&self.inner, TunnelState::Disabled);
            return;
        }
        if !config.enabled {
            Inner::set_state(&self.inner, TunnelState::Stopped);
            return;
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(binary) = find_in_path(TUNNEL_BINARY) else {
            Inner::set_state(
                &self.inner,
                TunnelState::Error {
                    message: format!("{TUNNEL_BINARY} not found in PATH"),
                },
            );
            self.inner.running.store(false, Ordering::SeqCst);
            return;
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            Inner::run_loop(inner.clone(), binary, config.token, cancel_rx).await;
            inner.running.store(false, Ordering::SeqCst);
        });
        *self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some((cancel_tx, handle));
    }

    /// Cancel the monitor and wait out the child's grace period.
    pub async fn stop(&self) {
        let taken = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((cancel_tx, handle)) = taken {
            let _ = cancel_tx.send(true);
            if tokio::time::timeout(STOP_GRACE + Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!(target: "gamwich", "tunnel_stop_timeout");
            }
        }
        let has_token = !self
            .inner
            .config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .token
            .is_empty();
        Inner::set_state(
            &self.inner,
            if has_token {
                TunnelState::Stopped
            } else {
                TunnelState::Disabled
            },
        );
    }

    /// Atomically replace the configuration. A token or enablement change
    /// stops the current child and, when still enabled, starts a new one.
    pub async fn update_config(&self, config: TunnelConfig) {
        let changed = {
            let mut guard = self
                .inner
                .config
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let changed = *guard != config;
            *guard = config.clone();
            changed
        };
        if !changed {
            return;
        }
        self.stop().await;
        if config.enabled && !config.token.is_empty() {
            self.start();
        }
    }
}

impl Inner {
    fn set_state(inner: &Arc<Inner>, state: TunnelState) {
        {
            let mut guard = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if *guard == state {
                return;
            }
            *guard = state.clone();
        }
        // Callback runs outside the lock; it typically feeds the hub.
        (inner.callback)(&state);
    }

    async fn run_loop(
        inner: Arc<Inner>,
        binary: PathBuf,
        token: String,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut backoff = INITIAL_BACKOFF;
        let mut consecutive_failures: u32 = 0;

        loop {
            Inner::set_state(&inner, TunnelState::Connecting);
            let mut child = match Command::new(&binary)
                .args(["tunnel", "run", "--token", &token])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => child,
                Err(err) => {
                    warn!(target: "gamwich", error = %err, "tunnel_spawn_failed");
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        Inner::set_state(
                            &inner,
                            TunnelState::Error {
                                message: format!("failed to spawn tunnel: {err}"),
                            },
                        );
                        return;
                    }
                    if Inner::sleep_or_cancel(&mut cancel, backoff).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            let stderr = child.stderr.take();
            let mut connected_this_run = false;

            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        changed = cancel.changed() => {
                            if changed.is_err() || *cancel.borrow() {
                                Inner::shutdown_child(&mut child).await;
                                return;
                            }
                        }
                        line = lines.next_line() => {
                            match line {
                                Ok(Some(line)) => match parse_line(&line) {
                                    LogEvent::Connected { hostname } => {
                                        connected_this_run = true;
                                        consecutive_failures = 0;
                                        backoff = INITIAL_BACKOFF;
                                        Inner::set_state(
                                            &inner,
                                            TunnelState::Connected { hostname },
                                        );
                                    }
                                    LogEvent::Reconnecting => {
                                        Inner::set_state(&inner, TunnelState::Reconnecting);
                                    }
                                    LogEvent::Ignored => {}
                                },
                                // Stream closed: the child is exiting.
                                Ok(None) | Err(_) => break,
                            }
                        }
                    }
                }
            }

            let status = child.wait().await;
            info!(
                target: "gamwich",
                status = %status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string()),
                "tunnel_child_exited"
            );

            if !connected_this_run {
                consecutive_failures += 1;
            }
            if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                Inner::set_state(
                    &inner,
                    TunnelState::Error {
                        message: format!(
                            "tunnel failed {MAX_CONSECUTIVE_FAILURES} times in a row"
                        ),
                    },
                );
                return;
            }

            Inner::set_state(&inner, TunnelState::Reconnecting);
            if Inner::sleep_or_cancel(&mut cancel, backoff).await {
                return;
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Returns true when cancelled.
    async fn sleep_or_cancel(cancel: &mut watch::Receiver<bool>, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => false,
            changed = cancel.changed() => changed.is_err() || *cancel.borrow(),
        }
    }

    async fn shutdown_child(child: &mut tokio::process::Child) {
        let _ = child.start_kill();
        if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
            warn!(target: "gamwich", "tunnel_child_kill_timeout");
        }
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
