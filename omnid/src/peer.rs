//! Client for the peer session service hosted inside the IDE.
//!
//! The peer exposes a small HTTP API (`/api/projects`, `/api/close-project`)
//! and the same streaming protocol the agent serves. Every call carries the
//! agent token in `X-Omni-Token`.

use std::path::PathBuf;
use std::time::Duration;

use omni_common::config::PeerConfig;
use omni_common::AgentError;
use serde_json::Value;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::debug;

use crate::auth::TOKEN_HEADER;

/// A project the peer currently has open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerProject {
    pub name: String,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PeerClient {
    config: PeerConfig,
    token: String,
    http: reqwest::Client,
}

fn relay_err(context: &str, err: impl std::fmt::Display) -> AgentError {
    AgentError::RelayFailure(format!("{context}: {err}"))
}

impl PeerClient {
    pub fn new(config: &PeerConfig, token: impl Into<String>) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| relay_err("build http client", e))?;
        Ok(Self {
            config: config.clone(),
            token: token.into(),
            http,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether sessions for peer-managed projects are relayed.
    pub fn proxies_sessions(&self) -> bool {
        self.config.enabled && self.config.proxy_sessions
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.http_base(), path)
    }

    fn ensure_enabled(&self) -> Result<(), AgentError> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(AgentError::RelayFailure("peer is disabled".to_string()))
        }
    }

    /// The peer's project listing, as returned.
    pub async fn projects_raw(&self) -> Result<Value, AgentError> {
        self.ensure_enabled()?;
        let response = self
            .http
            .get(self.url("/api/projects"))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| relay_err("list peer projects", e))?
            .error_for_status()
            .map_err(|e| relay_err("list peer projects", e))?;
        response
            .json()
            .await
            .map_err(|e| relay_err("decode peer projects", e))
    }

    pub async fn projects(&self) -> Result<Vec<PeerProject>, AgentError> {
        Ok(parse_projects(&self.projects_raw().await?))
    }

    /// Look up `name` (case-insensitive) in the peer's live list. A disabled
    /// peer knows no projects.
    pub async fn find_project(&self, name: &str) -> Result<Option<PeerProject>, AgentError> {
        if !self.config.enabled {
            return Ok(None);
        }
        let projects = self.projects().await?;
        debug!(count = projects.len(), "peer project list fetched");
        Ok(projects
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name)))
    }

    pub async fn close_project(&self, name: &str) -> Result<Value, AgentError> {
        self.ensure_enabled()?;
        let url = reqwest::Url::parse_with_params(&self.url("/api/close-project"), &[("name", name)])
            .map_err(|e| relay_err("build close url", e))?;
        let response = self
            .http
            .post(url)
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| relay_err("close peer project", e))?
            .error_for_status()
            .map_err(|e| relay_err("close peer project", e))?;
        let body = response
            .text()
            .await
            .map_err(|e| relay_err("read close response", e))?;
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    /// Handshake request for the peer's streaming endpoint.
    pub fn ws_request(&self) -> Result<Request, AgentError> {
        self.ensure_enabled()?;
        let mut request = self
            .config
            .ws_url()
            .into_client_request()
            .map_err(|e| relay_err("build peer request", e))?;
        let token = HeaderValue::from_str(&self.token).map_err(|e| relay_err("token header", e))?;
        request.headers_mut().insert(TOKEN_HEADER, token);
        Ok(request)
    }
}

/// Accepts `{"projects": [...]}` or a bare array; entries are names or
/// objects with `name` and an optional `path`/`basePath`.
pub fn parse_projects(value: &Value) -> Vec<PeerProject> {
    let list = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("projects") {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    list.iter()
        .filter_map(|item| match item {
            Value::String(name) => Some(PeerProject {
                name: name.clone(),
                path: None,
            }),
            Value::Object(map) => {
                let name = map.get("name")?.as_str()?.to_string();
                let path = ["path", "basePath"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(Value::as_str))
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from);
                Some(PeerProject { name, path })
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wrapped_and_bare_lists() {
        let wrapped = json!({"projects": [{"name": "Demo", "path": "/w/Demo"}, "Other"]});
        let parsed = parse_projects(&wrapped);
        assert_eq!(
            parsed,
            vec![
                PeerProject {
                    name: "Demo".into(),
                    path: Some(PathBuf::from("/w/Demo")),
                },
                PeerProject {
                    name: "Other".into(),
                    path: None,
                },
            ]
        );

        let bare = json!([{"name": "X", "basePath": "/w/X"}, {"path": "/no/name"}, 7]);
        let parsed = parse_projects(&bare);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].path, Some(PathBuf::from("/w/X")));
    }

    #[test]
    fn unexpected_shapes_yield_nothing() {
        assert!(parse_projects(&json!({"error": "nope"})).is_empty());
        assert!(parse_projects(&json!("text")).is_empty());
    }

    #[test]
    fn ws_request_carries_token_header() {
        let config = PeerConfig {
            port: 9999,
            ..PeerConfig::default()
        };
        let client = PeerClient::new(&config, "secret").unwrap();
        let request = client.ws_request().unwrap();
        assert_eq!(request.uri().to_string(), "ws://127.0.0.1:9999/ws/terminal");
        assert_eq!(request.headers().get(TOKEN_HEADER).unwrap(), "secret");
    }

    #[tokio::test]
    async fn disabled_peer_knows_no_projects() {
        let config = PeerConfig {
            enabled: false,
            ..PeerConfig::default()
        };
        let client = PeerClient::new(&config, "secret").unwrap();
        assert_eq!(client.find_project("demo").await.unwrap(), None);
        assert!(client.projects_raw().await.is_err());
        assert!(!client.proxies_sessions());
    }
}
