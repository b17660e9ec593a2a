//! Agent configuration.
//!
//! Layering, lowest to highest precedence:
//! 1. built-in defaults
//! 2. TOML file (`--config`, else `<config dir>/omni-agent/agent.toml` if present)
//! 3. `OMNI_*` environment variables
//! 4. command-line flags (applied by the daemon)

mod env;
mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path_guard::{PathSafetyPolicy, default_deny_roots};
use crate::util::generate_token;

/// Errors raised while assembling the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Env(Vec<EnvError>),
}

/// Expand `~` and return a path.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw.trim()).into_owned())
}

/// Default location of the config file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("omni-agent").join("agent.toml"))
}

// ── Sections ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret; generated at startup when empty.
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub workspace_root: PathBuf,
    pub backup_root: Option<PathBuf>,
    /// Working directory for sessions that name none; the workspace root
    /// when unset.
    pub default_cwd: Option<PathBuf>,
    pub allow_roots: Vec<PathBuf>,
    pub deny_roots: Vec<PathBuf>,
    /// Registry cache and logs.
    pub state_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workspace_root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("OmniProjects"),
            backup_root: None,
            default_cwd: None,
            allow_roots: Vec::new(),
            deny_roots: default_deny_roots(),
            state_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell program; `sh` (Unix) or `cmd` (Windows) when unset.
    pub program: Option<String>,
    /// Arguments placed before the command string.
    pub args: Vec<String>,
}

impl ShellConfig {
    /// Program and leading arguments to use.
    pub fn resolved(&self) -> (String, Vec<String>) {
        match &self.program {
            Some(program) => (program.clone(), self.args.clone()),
            None if cfg!(windows) => ("cmd".to_string(), vec!["/C".to_string()]),
            None => ("sh".to_string(), vec!["-c".to_string()]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub enabled: bool,
    /// Relay sessions for peer-managed projects. When false, such a session
    /// runs locally in the directory the peer reports.
    pub proxy_sessions: bool,
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            proxy_sessions: true,
            host: "127.0.0.1".to_string(),
            port: 8766,
            timeout_secs: 5,
        }
    }
}

impl PeerConfig {
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws/terminal", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectsConfig {
    /// Names omitted from listings (case-insensitive).
    pub hidden: Vec<String>,
}

impl ProjectsConfig {
    pub fn is_hidden(&self, name: &str) -> bool {
        self.hidden.iter().any(|h| h.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareConfig {
    pub enabled: bool,
    pub uninstall_unused: bool,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(windows),
            uninstall_unused: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdeConfig {
    pub studio_command: Option<PathBuf>,
}

// ── Root ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub paths: PathsConfig,
    pub shell: ShellConfig,
    pub peer: PeerConfig,
    pub projects: ProjectsConfig,
    pub software: SoftwareConfig,
    pub ide: IdeConfig,
}

impl AgentConfig {
    /// Load from an explicit file, or the default file when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(raw)?;
        config.expand_paths();
        Ok(config)
    }

    /// Apply `OMNI_*` overrides. All invalid variables are reported together.
    pub fn apply_env(&mut self, parser: &mut EnvParser) -> Result<(), ConfigError> {
        if let Some(v) = parser.get_opt_string("BIND_HOST") {
            self.server.bind_host = v.value;
        }
        self.server.port = parser
            .get_u16_range("PORT", self.server.port, 1, u16::MAX)
            .value;
        if let Some(v) = parser.get_opt_string("ACCESS_TOKEN") {
            self.auth.token = v.value;
        }
        if let Some(v) = parser.get_opt_path("WORKSPACE_ROOT") {
            self.paths.workspace_root = v.value;
        }
        if let Some(v) = parser.get_opt_path("BACKUP_ROOT") {
            self.paths.backup_root = Some(v.value);
        }
        if let Some(v) = parser.get_opt_path("DEFAULT_CWD") {
            self.paths.default_cwd = Some(v.value);
        }
        if let Some(v) = parser.get_path_list("ALLOWED_ROOTS") {
            self.paths.allow_roots = v.value;
        }
        if let Some(v) = parser.get_path_list("DENY_ROOTS") {
            self.paths.deny_roots = v.value;
        }
        if let Some(v) = parser.get_opt_path("STATE_DIR") {
            self.paths.state_dir = Some(v.value);
        }
        if let Some(v) = parser.get_opt_string("SHELL") {
            self.shell.program = Some(v.value);
        }
        self.peer.enabled = parser.get_bool("PEER_ENABLED", self.peer.enabled).value;
        self.peer.proxy_sessions = parser
            .get_bool("PEER_PROXY_SESSIONS", self.peer.proxy_sessions)
            .value;
        if let Some(v) = parser.get_opt_string("PEER_HOST") {
            self.peer.host = v.value;
        }
        self.peer.port = parser
            .get_u16_range("PEER_PORT", self.peer.port, 1, u16::MAX)
            .value;
        if let Some(v) = parser.get_string_list("HIDDEN_PROJECTS") {
            self.projects.hidden = v.value;
        }
        self.software.enabled = parser
            .get_bool("SOFTWARE_ENABLED", self.software.enabled)
            .value;
        self.software.uninstall_unused = parser
            .get_bool("UNINSTALL_UNUSED", self.software.uninstall_unused)
            .value;
        if let Some(v) = parser.get_opt_path("STUDIO_COMMAND") {
            self.ide.studio_command = Some(v.value);
        }

        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        let expand = |p: &Path| expand_path(&p.to_string_lossy());
        self.paths.workspace_root = expand(&self.paths.workspace_root);
        self.paths.backup_root = self.paths.backup_root.as_deref().map(expand);
        self.paths.default_cwd = self.paths.default_cwd.as_deref().map(expand);
        self.paths.state_dir = self.paths.state_dir.as_deref().map(expand);
        self.paths.allow_roots = self.paths.allow_roots.iter().map(|p| expand(p)).collect();
        self.paths.deny_roots = self.paths.deny_roots.iter().map(|p| expand(p)).collect();
    }

    /// Generate a token when none is configured. Returns true if generated.
    pub fn ensure_token(&mut self) -> bool {
        if self.auth.token.trim().is_empty() {
            self.auth.token = generate_token();
            true
        } else {
            false
        }
    }

    /// Guard policy derived from the `[paths]` section. The backup root is
    /// reachable in addition to the configured allow roots.
    pub fn path_policy(&self) -> PathSafetyPolicy {
        PathSafetyPolicy::new(&self.paths.workspace_root)
            .with_allow_roots(&self.paths.allow_roots)
            .with_allow_roots(self.paths.backup_root.iter())
            .with_deny_roots(&self.paths.deny_roots)
    }

    pub fn default_cwd(&self) -> PathBuf {
        self.paths
            .default_cwd
            .clone()
            .unwrap_or_else(|| self.paths.workspace_root.clone())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.paths.state_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("omni-agent")
        })
    }

    /// Copy safe to print: the token is masked.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        if !copy.auth.token.is_empty() {
            copy.auth.token = "***".to_string();
        }
        copy
    }
}
