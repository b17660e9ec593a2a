//! Error taxonomy shared by the HTTP surface and the session protocol.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::path_guard::PathDenial;

/// Every failure the agent reports to a remote caller.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing, malformed or mismatched token.
    #[error("unauthorized")]
    Unauthorized,

    /// The Path Safety Guard rejected a path.
    #[error("path not allowed: {} ({reason})", path.display())]
    UnsafePath { path: PathBuf, reason: PathDenial },

    /// A project, backup or launcher does not exist.
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    /// The backup root has not been configured.
    #[error("backup root is not configured")]
    NotConfigured,

    /// Another transition holds the project lock.
    #[error("operation already in progress for project '{0}'")]
    OperationInProgress(String),

    /// A child process could not be started.
    #[error("failed to start process: {0}")]
    SpawnFailure(String),

    /// The peer session service was unreachable or misbehaved.
    #[error("peer session service failed: {0}")]
    RelayFailure(String),

    /// The project's `omni.json` could not be parsed.
    #[error("invalid manifest {}: {message}", path.display())]
    InvalidManifest { path: PathBuf, message: String },

    /// The request payload is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A filesystem step failed.
    #[error("{step} failed for {}: {source}", path.display())]
    Io {
        step: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AgentError {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn io(step: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            step,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Stable machine-readable identifier.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::UnsafePath { .. } => "unsafe_path",
            Self::NotFound { .. } => "not_found",
            Self::NotConfigured => "not_configured",
            Self::OperationInProgress(_) => "operation_in_progress",
            Self::SpawnFailure(_) => "spawn_failure",
            Self::RelayFailure(_) => "relay_failure",
            Self::InvalidManifest { .. } => "invalid_manifest",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Io { .. } => "io_error",
        }
    }

    /// HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::NotFound { .. } => 404,
            Self::UnsafePath { .. }
            | Self::NotConfigured
            | Self::OperationInProgress(_)
            | Self::InvalidManifest { .. }
            | Self::InvalidRequest(_) => 400,
            Self::SpawnFailure(_) | Self::RelayFailure(_) | Self::Io { .. } => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_statuses() {
        assert_eq!(AgentError::Unauthorized.http_status(), 401);
        assert_eq!(AgentError::not_found("project", "demo").http_status(), 404);
        assert_eq!(AgentError::NotConfigured.http_status(), 400);
        assert_eq!(
            AgentError::OperationInProgress("demo".into()).http_status(),
            400
        );
        assert_eq!(AgentError::SpawnFailure("x".into()).http_status(), 500);
        assert_eq!(AgentError::RelayFailure("x".into()).http_status(), 500);
    }

    #[test]
    fn messages_are_human_readable() {
        let err = AgentError::UnsafePath {
            path: PathBuf::from("/etc/passwd"),
            reason: PathDenial::OutsideAllowedRoots,
        };
        assert_eq!(
            err.to_string(),
            "path not allowed: /etc/passwd (outside allowed roots)"
        );
        assert_eq!(err.code(), "unsafe_path");

        let err = AgentError::io(
            "copy project tree",
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.to_string(), "copy project tree failed for /tmp/x: gone");
    }
}
