//! Session protocol spoken on the streaming endpoint.
//!
//! Frames are JSON objects tagged by `"type"`. Session ids travel as
//! `"sessionId"` to stay compatible with the mobile client and the IDE peer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::types::SYSTEM_PROJECT;

/// Client to agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a new session.
    Run {
        cmd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// Feed data to a session's standard input.
    Stdin {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    /// Ask a session to terminate.
    Cancel {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl ClientMessage {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, AgentError> {
        serde_json::from_str(text).map_err(|e| AgentError::InvalidRequest(e.to_string()))
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Agent to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Started {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Output {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    /// `code` is the decimal exit status, or empty when the process was
    /// terminated by a signal.
    Exit {
        #[serde(rename = "sessionId")]
        session_id: String,
        code: String,
    },
    Error {
        message: String,
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            session_id: None,
        }
    }

    pub fn session_error(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            session_id: Some(session_id.into()),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Started { session_id }
            | Self::Output { session_id, .. }
            | Self::Exit { session_id, .. } => Some(session_id),
            Self::Error { session_id, .. } => session_id.as_deref(),
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> String {
        // Every variant holds only strings, so serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// `None` or the sentinel `"system"` (any case) means a host-local session.
pub fn is_system_project(project: Option<&str>) -> bool {
    match project.map(str::trim) {
        None | Some("") => true,
        Some(name) => name.eq_ignore_ascii_case(SYSTEM_PROJECT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_minimal_run() {
        let msg = ClientMessage::decode(r#"{"type":"run","cmd":"echo hi"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Run {
                cmd: "echo hi".into(),
                cwd: None,
                project: None,
                env: BTreeMap::new(),
            }
        );
    }

    #[test]
    fn decodes_stdin_and_cancel_with_camel_case_id() {
        let msg = ClientMessage::decode(r#"{"type":"stdin","sessionId":"s1","data":"y\n"}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Stdin {
                session_id: "s1".into(),
                data: "y\n".into()
            }
        );
        let msg = ClientMessage::decode(r#"{"type":"cancel","sessionId":"s1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Cancel {
                session_id: "s1".into()
            }
        );
    }

    #[test]
    fn unknown_type_is_an_invalid_request() {
        let err = ClientMessage::decode(r#"{"type":"resize","cols":80}"#).unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        let err = ClientMessage::decode("not json").unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn server_frames_have_expected_shape() {
        let started: serde_json::Value = serde_json::from_str(
            &ServerMessage::Started {
                session_id: "abc".into(),
            }
            .encode(),
        )
        .unwrap();
        assert_eq!(started, json!({"type": "started", "sessionId": "abc"}));

        let exit: serde_json::Value = serde_json::from_str(
            &ServerMessage::Exit {
                session_id: "abc".into(),
                code: "0".into(),
            }
            .encode(),
        )
        .unwrap();
        assert_eq!(exit, json!({"type": "exit", "sessionId": "abc", "code": "0"}));

        let error: serde_json::Value =
            serde_json::from_str(&ServerMessage::error("boom").encode()).unwrap();
        assert_eq!(error, json!({"type": "error", "message": "boom"}));
    }

    #[test]
    fn system_project_sentinel() {
        assert!(is_system_project(None));
        assert!(is_system_project(Some("System")));
        assert!(is_system_project(Some("  ")));
        assert!(!is_system_project(Some("demo")));
    }
}
