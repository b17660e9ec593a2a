//! Proxy Relay: a session forwarded to the peer session service.
//!
//! [`ProxyRelay`] is the pure state machine (dialing, started, relaying,
//! closed) holding the translation from the externally visible session id to
//! the peer's id. [`run`] drives it over a WebSocket to the peer.

use futures::{SinkExt, StreamExt};
use omni_common::{ClientMessage, ServerMessage};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{SessionCommand, SessionControl, SessionEvent};
use crate::peer::PeerClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Connecting to the peer.
    Dialing,
    /// The `run` was forwarded; waiting for the peer's `started`.
    Started,
    /// The peer's session id is known.
    Relaying,
    Closed,
}

/// What a peer frame produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RelayStep {
    pub to_client: Option<ServerMessage>,
    pub to_peer: Vec<ClientMessage>,
}

#[derive(Debug)]
pub struct ProxyRelay {
    external_id: String,
    peer_id: Option<String>,
    state: RelayState,
    pending: Vec<SessionCommand>,
}

impl ProxyRelay {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            peer_id: None,
            state: RelayState::Dialing,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.state == RelayState::Closed
    }

    pub fn on_connected(&mut self) {
        if self.state == RelayState::Dialing {
            self.state = RelayState::Started;
        }
    }

    pub fn close(&mut self) {
        self.state = RelayState::Closed;
        self.pending.clear();
    }

    fn translate(&self, command: SessionCommand) -> Option<ClientMessage> {
        let session_id = self.peer_id.clone()?;
        Some(match command {
            SessionCommand::Stdin(data) => ClientMessage::Stdin { session_id, data },
            SessionCommand::Cancel => ClientMessage::Cancel { session_id },
        })
    }

    /// A client command for the peer, or `None` while it has to wait for the
    /// peer's id (it is buffered) or after the relay closed (it is dropped).
    pub fn outbound(&mut self, command: SessionCommand) -> Option<ClientMessage> {
        match self.state {
            RelayState::Closed => None,
            RelayState::Relaying => self.translate(command),
            RelayState::Dialing | RelayState::Started => {
                self.pending.push(command);
                None
            }
        }
    }

    /// Rewrite one peer frame for the client.
    pub fn on_peer_frame(&mut self, text: &str) -> RelayStep {
        if self.is_closed() {
            return RelayStep::default();
        }
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return RelayStep {
                to_client: Some(self.output(text.to_string())),
                to_peer: Vec::new(),
            };
        };
        let field = |name: &str| value.get(name).and_then(Value::as_str);

        match field("type") {
            Some("started") => {
                let Some(peer_id) = field("sessionId") else {
                    warn!(session = %self.external_id, "peer started frame without a session id");
                    return RelayStep::default();
                };
                debug!(session = %self.external_id, peer_session = %peer_id, "peer session started");
                self.peer_id = Some(peer_id.to_string());
                self.state = RelayState::Relaying;
                let pending = std::mem::take(&mut self.pending);
                RelayStep {
                    to_client: None,
                    to_peer: pending
                        .into_iter()
                        .filter_map(|command| self.translate(command))
                        .collect(),
                }
            }
            Some("output") => RelayStep {
                to_client: Some(self.output(field("data").unwrap_or_default().to_string())),
                to_peer: Vec::new(),
            },
            Some("exit") => {
                let code = match value.get("code") {
                    Some(Value::String(code)) => code.clone(),
                    Some(Value::Number(code)) => code.to_string(),
                    _ => String::new(),
                };
                self.close();
                RelayStep {
                    to_client: Some(ServerMessage::Exit {
                        session_id: self.external_id.clone(),
                        code,
                    }),
                    to_peer: Vec::new(),
                }
            }
            Some("error") => RelayStep {
                to_client: Some(ServerMessage::session_error(
                    &self.external_id,
                    field("message").unwrap_or("peer error"),
                )),
                to_peer: Vec::new(),
            },
            other => {
                debug!(session = %self.external_id, frame_type = ?other, "dropping peer frame");
                RelayStep::default()
            }
        }
    }

    fn output(&self, data: String) -> ServerMessage {
        ServerMessage::Output {
            session_id: self.external_id.clone(),
            data,
        }
    }
}

/// Start the relay task for `run_payload`.
pub fn spawn(
    peer: PeerClient,
    session_id: String,
    run_payload: ClientMessage,
    events: mpsc::Sender<SessionEvent>,
) -> SessionControl {
    let (control, commands) = SessionControl::channel();
    tokio::spawn(run(peer, session_id, run_payload, commands, events));
    control
}

async fn run(
    peer: PeerClient,
    session_id: String,
    run_payload: ClientMessage,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut relay = ProxyRelay::new(session_id.clone());
    let error = drive(&peer, &mut relay, run_payload, &mut commands, &events)
        .await
        .err();
    if let Some(error) = &error {
        warn!(session = %session_id, error = %error, "proxy relay failed");
    }
    let _ = events.send(SessionEvent::Ended { session_id, error }).await;
}

async fn drive(
    peer: &PeerClient,
    relay: &mut ProxyRelay,
    run_payload: ClientMessage,
    commands: &mut mpsc::Receiver<SessionCommand>,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<(), String> {
    let request = peer.ws_request().map_err(|e| e.to_string())?;
    let (stream, _response) = connect_async(request)
        .await
        .map_err(|e| format!("peer session service unreachable: {e}"))?;
    let (mut sink, mut stream) = stream.split();

    sink.send(Message::Text(run_payload.encode().into()))
        .await
        .map_err(|e| format!("failed to forward run: {e}"))?;
    relay.on_connected();
    info!(session = %relay.external_id, "proxy relay connected");

    let outcome = 'relay: loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let step = relay.on_peer_frame(text.as_str());
                    for message in step.to_peer {
                        if let Err(e) = sink.send(Message::Text(message.encode().into())).await {
                            break 'relay Err(format!("peer write failed: {e}"));
                        }
                    }
                    if let Some(frame) = step.to_client {
                        if events.send(SessionEvent::Frame(frame)).await.is_err() {
                            break Ok(());
                        }
                    }
                    if relay.is_closed() {
                        break Ok(());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    break Err("peer closed the session".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(format!("peer connection failed: {e}")),
            },
            command = commands.recv() => match command {
                Some(command) => {
                    if let Some(message) = relay.outbound(command) {
                        if let Err(e) = sink.send(Message::Text(message.encode().into())).await {
                            break Err(format!("peer write failed: {e}"));
                        }
                    }
                }
                None => {
                    // Owner gone: forward a cancel and stop.
                    if let Some(message) = relay.outbound(SessionCommand::Cancel) {
                        let _ = sink.send(Message::Text(message.encode().into())).await;
                    }
                    relay.close();
                    break Ok(());
                }
            },
        }
    };
    debug!(
        session = %relay.external_id,
        state = ?relay.state(),
        peer_session = ?relay.peer_id(),
        "proxy relay finished"
    );
    relay.close();
    let _ = sink.close().await;
    outcome
}
