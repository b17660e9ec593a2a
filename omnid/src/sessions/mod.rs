//! Session Multiplexer: the table of running sessions and the plumbing
//! between a connection loop and the tasks that drive each session.
//!
//! Every connection owns one bounded event queue. Session tasks push
//! [`SessionEvent`]s into it; the connection loop is the only consumer and
//! the only writer to the socket. A session has exactly one producer task,
//! so its frames arrive in the order they were produced.

pub mod local;
pub mod proxy;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use omni_common::{AgentError, ServerMessage, is_system_project, validate_project_name};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::AgentContext;

/// Capacity of a connection's event queue.
pub const EVENT_QUEUE: usize = 256;
/// Capacity of a session's command queue.
const COMMAND_QUEUE: usize = 64;

pub type ConnectionId = u64;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed)
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Local,
    Proxy,
}

/// Connection loop to session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Stdin(String),
    Cancel,
}

/// Session task to connection loop.
#[derive(Debug)]
pub enum SessionEvent {
    Frame(ServerMessage),
    /// The task finished. `error` is set when it ended without an exit frame
    /// because something failed.
    Ended {
        session_id: String,
        error: Option<String>,
    },
}

/// Sending half of a session's command queue.
#[derive(Debug, Clone)]
pub struct SessionControl {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionControl {
    pub fn channel() -> (Self, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        (Self { tx }, rx)
    }

    /// Queue a command without waiting.
    pub fn send(&self, command: SessionCommand) -> Result<(), AgentError> {
        self.tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => {
                AgentError::InvalidRequest("session input queue is full".to_string())
            }
            TrySendError::Closed(_) => AgentError::InvalidRequest("session has ended".to_string()),
        })
    }
}

#[derive(Debug)]
pub struct SessionEntry {
    pub connection: ConnectionId,
    pub kind: SessionKind,
    pub created_at: DateTime<Utc>,
    pub control: SessionControl,
}

/// All live sessions, keyed by the externally visible id.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, session_id: String, entry: SessionEntry) {
        self.lock().insert(session_id, entry);
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionEntry> {
        self.lock().remove(session_id)
    }

    /// Control handle for a session owned by `connection`. Sessions of
    /// other connections are invisible.
    pub fn control_for(&self, connection: ConnectionId, session_id: &str) -> Option<SessionControl> {
        self.lock()
            .get(session_id)
            .filter(|entry| entry.connection == connection)
            .map(|entry| entry.control.clone())
    }

    /// Remove and return every session owned by `connection`.
    pub fn drain_connection(&self, connection: ConnectionId) -> Vec<(String, SessionEntry)> {
        let mut table = self.lock();
        let ids: Vec<String> = table
            .iter()
            .filter(|(_, entry)| entry.connection == connection)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| table.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Where a `run` request executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    Local { cwd: PathBuf },
    Proxy { project: String },
}

/// Decide where a `run` executes.
///
/// No project (or `system`): the explicit cwd, else the default cwd. A
/// project the peer lists is relayed, or runs in the peer's directory for it
/// when relaying is off. Otherwise the project must exist under the
/// workspace root. Every local directory passes the Guard.
pub async fn resolve_target(
    ctx: &AgentContext,
    cwd: Option<&str>,
    project: Option<&str>,
) -> Result<SessionTarget, AgentError> {
    let explicit = cwd.map(str::trim).filter(|c| !c.is_empty()).map(PathBuf::from);

    if is_system_project(project) {
        let dir = explicit.unwrap_or_else(|| ctx.config.default_cwd());
        return Ok(SessionTarget::Local {
            cwd: ctx.guard.ensure_safe(dir)?,
        });
    }

    let name = project.map(str::trim).unwrap_or_default();
    validate_project_name(name)?;

    match ctx.peer.find_project(name).await {
        Ok(Some(found)) if ctx.peer.proxies_sessions() => {
            debug!(project = %found.name, "project is managed by the peer");
            return Ok(SessionTarget::Proxy {
                project: found.name,
            });
        }
        Ok(Some(found)) => {
            if let Some(path) = found.path {
                let dir = explicit.unwrap_or(path);
                return Ok(SessionTarget::Local {
                    cwd: ctx.guard.ensure_safe(dir)?,
                });
            }
        }
        Ok(None) => {}
        Err(e) => warn!(project = %name, error = %e, "peer lookup failed; using workspace"),
    }

    let project_dir = ctx.config.paths.workspace_root.join(name);
    if !project_dir.is_dir() {
        return Err(AgentError::not_found("project", name));
    }
    let dir = explicit.unwrap_or(project_dir);
    Ok(SessionTarget::Local {
        cwd: ctx.guard.ensure_safe(dir)?,
    })
}
