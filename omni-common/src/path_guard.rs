//! Path safety policy for filesystem arguments supplied by remote callers.
//!
//! Every working directory, manifest resource path and project directory is
//! run through [`PathSafetyPolicy::check`] before the agent touches it. The
//! input is normalized lexically (made absolute, `.` and `..` collapsed) and
//! then compared component-wise against the configured roots:
//!
//! 1. inside the workspace root: tentatively allowed
//! 2. inside an allow root (when any are configured): tentatively allowed
//! 3. no allow roots and outside the workspace: denied
//! 4. inside any deny root: denied, even over 1 and 2
//!
//! The check never touches the filesystem. Symlinks are not resolved.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

// ── Denial reasons ──────────────────────────────────────────────────────

/// Why a path was rejected by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathDenial {
    /// The supplied path was empty.
    Empty,
    /// The path is outside the workspace root and every allow root.
    OutsideAllowedRoots,
    /// The path is inside a deny root.
    DenyListed,
}

impl fmt::Display for PathDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty path"),
            Self::OutsideAllowedRoots => write!(f, "outside allowed roots"),
            Self::DenyListed => write!(f, "inside a protected location"),
        }
    }
}

// ── Policy ──────────────────────────────────────────────────────────────

/// Workspace root plus allow/deny lists.
///
/// Relative inputs are resolved against the workspace root, so `"demo"` and
/// `"<workspace>/demo"` are the same path to the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSafetyPolicy {
    workspace_root: PathBuf,
    allow_roots: Vec<PathBuf>,
    deny_roots: Vec<PathBuf>,
}

impl PathSafetyPolicy {
    /// Policy that permits only the workspace root.
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        let workspace_root = collapse(workspace_root.as_ref());
        Self {
            workspace_root,
            allow_roots: Vec::new(),
            deny_roots: Vec::new(),
        }
    }

    /// Add roots that are reachable in addition to the workspace.
    pub fn with_allow_roots<I, P>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let resolved: Vec<PathBuf> = roots
            .into_iter()
            .filter(|p| !p.as_ref().as_os_str().is_empty())
            .map(|p| self.resolve(p.as_ref()))
            .collect();
        self.allow_roots.extend(resolved);
        self
    }

    /// Add roots that are never reachable.
    pub fn with_deny_roots<I, P>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let resolved: Vec<PathBuf> = roots
            .into_iter()
            .filter(|p| !p.as_ref().as_os_str().is_empty())
            .map(|p| self.resolve(p.as_ref()))
            .collect();
        self.deny_roots.extend(resolved);
        self
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn allow_roots(&self) -> &[PathBuf] {
        &self.allow_roots
    }

    pub fn deny_roots(&self) -> &[PathBuf] {
        &self.deny_roots
    }

    /// Normalize `path` to the absolute, `..`-free form the guard compares.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            collapse(path)
        } else {
            collapse(&self.workspace_root.join(path))
        }
    }

    /// Check a path, returning its normalized form when allowed.
    pub fn check(&self, path: impl AsRef<Path>) -> Result<PathBuf, PathDenial> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(PathDenial::Empty);
        }
        let normalized = self.resolve(path);

        let in_workspace = is_within(&normalized, &self.workspace_root);
        let in_allowed = self
            .allow_roots
            .iter()
            .any(|root| is_within(&normalized, root));
        if !in_workspace && !in_allowed {
            return Err(PathDenial::OutsideAllowedRoots);
        }

        if self
            .deny_roots
            .iter()
            .any(|root| is_within(&normalized, root))
        {
            return Err(PathDenial::DenyListed);
        }

        Ok(normalized)
    }

    /// Boolean form of [`check`](Self::check).
    pub fn is_safe(&self, path: impl AsRef<Path>) -> bool {
        self.check(path).is_ok()
    }

    /// Like [`check`](Self::check) but produces an [`AgentError::UnsafePath`].
    pub fn ensure_safe(&self, path: impl AsRef<Path>) -> Result<PathBuf, AgentError> {
        let path = path.as_ref();
        self.check(path).map_err(|reason| AgentError::UnsafePath {
            path: path.to_path_buf(),
            reason,
        })
    }
}

/// System locations that are never valid targets for remote operations.
pub fn default_deny_roots() -> Vec<PathBuf> {
    #[cfg(windows)]
    let roots = [
        r"C:\Windows",
        r"C:\Program Files",
        r"C:\Program Files (x86)",
        r"C:\ProgramData",
    ];
    #[cfg(not(windows))]
    let roots = [
        "/bin", "/boot", "/dev", "/etc", "/proc", "/sbin", "/sys", "/usr",
    ];
    roots.iter().map(PathBuf::from).collect()
}

/// Lexically collapse `.` and `..` without consulting the filesystem.
///
/// `..` at the root stays at the root.
fn collapse(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(segment) => out.push(segment),
        }
    }
    out
}

#[cfg(windows)]
fn is_within(path: &Path, root: &Path) -> bool {
    let fold = |p: &Path| PathBuf::from(p.to_string_lossy().to_lowercase());
    fold(path).starts_with(fold(root))
}

#[cfg(not(windows))]
fn is_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}
