//! Event broadcast for project transitions and session lifecycle.
//!
//! Events are JSON lines on a tokio broadcast channel. The daemon keeps one
//! subscriber that records them for presence sync; tests subscribe directly.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

const DEFAULT_BUFFER: usize = 256;

pub const PROJECT_ACTIVATED: &str = "project_activated";
pub const PROJECT_DEACTIVATED: &str = "project_deactivated";
pub const SESSION_STARTED: &str = "session_started";
pub const SESSION_EXITED: &str = "session_exited";

/// Broadcast channel for agent events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// The effective buffer is never smaller than `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit a structured event. Dropped silently when nobody listens.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("Failed to serialize event {}: {}", event, err),
        }
    }
}

/// Record every event at debug level. This is the hook point for presence
/// sync with the desktop app.
pub fn spawn_presence_log(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(line) => debug!(target: "omnid::presence", "{line}"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "presence log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
