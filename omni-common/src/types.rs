//! Data model shared between the agent and its persisted state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

/// Per-project manifest file name.
pub const MANIFEST_FILE: &str = "omni.json";
/// Hidden folder inside a project that stores relocated resources.
pub const ASSETS_DIR: &str = "_omni_assets";
/// Ledger file inside [`ASSETS_DIR`].
pub const RESTORE_MAP_FILE: &str = "restore_map.json";
/// Folder inside [`ASSETS_DIR`] receiving resources that could not be restored.
pub const QUARANTINE_DIR: &str = "_restored";
/// Metadata folder at the backup root; never treated as a project.
pub const CLOUD_META_DIR: &str = "_omni_sync";
/// Registry cache file name, both locally and in [`CLOUD_META_DIR`].
pub const REGISTRY_FILE: &str = "project_registry.json";
/// Project name that means "run on the agent host".
pub const SYSTEM_PROJECT: &str = "system";

// ── Project status ──────────────────────────────────────────────────────

/// Where a project's tree currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectStatus {
    /// Present under the workspace root.
    Local,
    /// Stored only under the backup root.
    Cloud,
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "Local"),
            Self::Cloud => write!(f, "Cloud"),
        }
    }
}

/// One entry of the reconciled registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub name: String,
    pub status: ProjectStatus,
}

/// Registry contents, ordered by name.
pub type RegistryMap = BTreeMap<String, ProjectStatus>;

// ── Manifest ────────────────────────────────────────────────────────────

/// Contents of a project's `omni.json`.
///
/// Unknown keys written by the desktop app are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectManifest {
    #[serde(default)]
    pub external_paths: Vec<PathBuf>,
    #[serde(default)]
    pub app_state_paths: Vec<PathBuf>,
    #[serde(default)]
    pub software: Vec<String>,
}

impl ProjectManifest {
    /// Read the manifest from a project directory. A missing file is an
    /// empty manifest.
    pub fn load(project_dir: &Path) -> Result<Self, AgentError> {
        let path = project_dir.join(MANIFEST_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(AgentError::io("read manifest", &path, e)),
        };
        serde_json::from_str(&raw).map_err(|e| AgentError::InvalidManifest {
            path,
            message: e.to_string(),
        })
    }

    /// External and app-state paths, in declaration order.
    pub fn resource_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.external_paths.iter().chain(self.app_state_paths.iter())
    }
}

// ── Restore ledger ──────────────────────────────────────────────────────

/// Ledger contents: resource id to original absolute path.
pub type RestoreMap = BTreeMap<String, PathBuf>;

/// Content-addressed id for a resource: BLAKE3 of its original path.
pub fn restore_id(original: &Path) -> String {
    blake3::hash(original.to_string_lossy().as_bytes())
        .to_hex()
        .to_string()
}
