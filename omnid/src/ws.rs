//! Streaming endpoint: one WebSocket carries many sessions.
//!
//! The connection loop below is the only writer to the socket. It answers
//! client frames directly and forwards whatever the session tasks push into
//! the connection's event queue.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use omni_common::{AgentError, ClientMessage, ServerMessage, mask_sensitive_command};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::token_from_headers;
use crate::context::AgentContext;
use crate::events::{SESSION_EXITED, SESSION_STARTED};
use crate::sessions::local::{self, LocalSpec};
use crate::sessions::{
    self, ConnectionId, EVENT_QUEUE, SessionCommand, SessionEntry, SessionEvent, SessionKind,
    SessionTarget, new_session_id, next_connection_id, resolve_target,
};

/// Handshake. The token comes from the headers or the `token` query
/// parameter; a bad one is told so with a policy-violation close.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AgentContext>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let presented = token_from_headers(&headers)
        .map(str::to_owned)
        .or_else(|| query.get("token").map(|t| t.trim().to_owned()));
    let authorized = ctx.auth.verify(presented.as_deref()).is_ok();

    ws.on_upgrade(move |socket| async move {
        if authorized {
            serve_connection(ctx, socket).await;
        } else {
            reject(socket).await;
        }
    })
}

async fn reject(mut socket: WebSocket) {
    debug!("closing unauthenticated session connection");
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Utf8Bytes::from_static("Unauthorized"),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

type Sink = SplitSink<WebSocket, Message>;

async fn send_frame(sink: &mut Sink, frame: &ServerMessage) -> Result<(), axum::Error> {
    sink.send(Message::Text(frame.encode().into())).await
}

async fn serve_connection(ctx: Arc<AgentContext>, socket: WebSocket) {
    let connection = next_connection_id();
    let (mut sink, mut stream) = socket.split();
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
    info!(connection, "session connection opened");

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = dispatch(&ctx, connection, text.as_str(), &events_tx).await;
                    if let Some(frame) = reply {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection, error = %e, "session connection failed");
                    break;
                }
            },
            Some(event) = events_rx.recv() => {
                if let Some(frame) = on_session_event(&ctx, event) {
                    if send_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    let orphans = ctx.sessions.drain_connection(connection);
    for (session_id, entry) in &orphans {
        debug!(connection, session = %session_id, "terminating orphaned session");
        let _ = entry.control.send(SessionCommand::Cancel);
    }
    info!(connection, terminated = orphans.len(), "session connection closed");
}

/// Handle one client frame; the return value is the immediate reply.
async fn dispatch(
    ctx: &AgentContext,
    connection: ConnectionId,
    text: &str,
    events: &mpsc::Sender<SessionEvent>,
) -> Option<ServerMessage> {
    let message = match ClientMessage::decode(text) {
        Ok(message) => message,
        Err(e) => return Some(ServerMessage::error(e.to_string())),
    };
    match message {
        run @ ClientMessage::Run { .. } => Some(
            match start_session(ctx, connection, run, events).await {
                Ok(session_id) => ServerMessage::Started { session_id },
                Err(e) => {
                    warn!(connection, error = %e, "run rejected");
                    ServerMessage::error(e.to_string())
                }
            },
        ),
        ClientMessage::Stdin { session_id, data } => {
            forward(ctx, connection, session_id, SessionCommand::Stdin(data))
        }
        ClientMessage::Cancel { session_id } => {
            forward(ctx, connection, session_id, SessionCommand::Cancel)
        }
    }
}

async fn start_session(
    ctx: &AgentContext,
    connection: ConnectionId,
    run: ClientMessage,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<String, AgentError> {
    let ClientMessage::Run {
        cmd,
        cwd,
        project,
        env,
    } = &run
    else {
        return Err(AgentError::InvalidRequest("expected a run frame".to_string()));
    };

    let target = resolve_target(ctx, cwd.as_deref(), project.as_deref()).await?;
    let session_id = new_session_id();
    let (kind, control) = match target {
        SessionTarget::Local { cwd } => {
            if cmd.trim().is_empty() {
                return Err(AgentError::InvalidRequest("cmd is required".to_string()));
            }
            info!(
                session = %session_id,
                cmd = %mask_sensitive_command(cmd),
                cwd = %cwd.display(),
                "starting local session"
            );
            let spec = LocalSpec {
                cmd: cmd.clone(),
                cwd,
                env: env.clone(),
            };
            let control = local::spawn(&ctx.config.shell, session_id.clone(), spec, events.clone())?;
            (SessionKind::Local, control)
        }
        SessionTarget::Proxy { project } => {
            info!(session = %session_id, project = %project, "relaying session to peer");
            let control = sessions::proxy::spawn(
                ctx.peer.clone(),
                session_id.clone(),
                run.clone(),
                events.clone(),
            );
            (SessionKind::Proxy, control)
        }
    };

    ctx.sessions.insert(
        session_id.clone(),
        SessionEntry {
            connection,
            kind,
            created_at: Utc::now(),
            control,
        },
    );
    ctx.events.emit(
        SESSION_STARTED,
        &json!({ "sessionId": session_id, "kind": kind, "project": project }),
    );
    Ok(session_id)
}

/// Route a command to a session this connection owns. Unknown ids are
/// answered with an error frame.
fn forward(
    ctx: &AgentContext,
    connection: ConnectionId,
    session_id: String,
    command: SessionCommand,
) -> Option<ServerMessage> {
    let Some(control) = ctx.sessions.control_for(connection, &session_id) else {
        return Some(ServerMessage::session_error(&session_id, "session not found"));
    };
    control
        .send(command)
        .err()
        .map(|e| ServerMessage::session_error(&session_id, e.to_string()))
}

/// Turn a session event into the frame for the client, retiring the
/// session when it is over.
fn on_session_event(ctx: &AgentContext, event: SessionEvent) -> Option<ServerMessage> {
    match event {
        SessionEvent::Frame(frame) => {
            if let ServerMessage::Exit { session_id, code } = &frame {
                if let Some(entry) = ctx.sessions.remove(session_id) {
                    ctx.events.emit(
                        SESSION_EXITED,
                        &json!({
                            "sessionId": session_id,
                            "kind": entry.kind,
                            "code": code,
                            "duration_secs": (Utc::now() - entry.created_at).num_seconds(),
                        }),
                    );
                }
            }
            Some(frame)
        }
        SessionEvent::Ended { session_id, error } => {
            let entry = ctx.sessions.remove(&session_id);
            if let Some(entry) = &entry {
                ctx.events.emit(
                    SESSION_EXITED,
                    &json!({
                        "sessionId": session_id,
                        "kind": entry.kind,
                        "error": error,
                        "duration_secs": (Utc::now() - entry.created_at).num_seconds(),
                    }),
                );
            }
            error.map(|message| ServerMessage::session_error(&session_id, message))
        }
    }
}
