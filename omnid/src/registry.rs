//! Project registry: name to Local/Cloud, reconciled against disk.
//!
//! The last-known map is merged from a mirrored cloud cache
//! (`<backup_root>/_omni_sync/project_registry.json`) and the local cache
//! (`<state_dir>/project_registry.json`), with local entries winning. A
//! parsed copy is kept in memory while both files' modification times are
//! unchanged. Every read-modify-write runs under one mutex.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use omni_common::types::{CLOUD_META_DIR, REGISTRY_FILE};
use omni_common::{AgentError, ProjectRecord, ProjectStatus, RegistryMap};
use tracing::{debug, warn};

/// Folder names that are never projects (compared case-insensitively).
const IGNORED_DIRS: &[&str] = &["$recycle.bin", "system volume information", CLOUD_META_DIR];

#[derive(Debug, Clone)]
struct CachedMap {
    map: RegistryMap,
    local_mtime: Option<SystemTime>,
    cloud_mtime: Option<SystemTime>,
}

#[derive(Debug)]
pub struct ProjectRegistry {
    workspace_root: PathBuf,
    backup_root: Option<PathBuf>,
    local_cache: PathBuf,
    cache: Mutex<Option<CachedMap>>,
}

impl ProjectRegistry {
    pub fn new(workspace_root: PathBuf, backup_root: Option<PathBuf>, state_dir: &Path) -> Self {
        Self {
            workspace_root,
            backup_root,
            local_cache: state_dir.join(REGISTRY_FILE),
            cache: Mutex::new(None),
        }
    }

    fn cloud_cache(&self) -> Option<PathBuf> {
        self.backup_root
            .as_ref()
            .map(|root| root.join(CLOUD_META_DIR).join(REGISTRY_FILE))
    }

    fn lock(&self) -> MutexGuard<'_, Option<CachedMap>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rescan both roots and return the reconciled map.
    pub fn reconcile(&self) -> Result<RegistryMap, AgentError> {
        let mut cache = self.lock();
        let loaded = self.load_known(&mut cache)?;

        let local = scan_project_dirs(&self.workspace_root)?;
        let mut next = loaded.clone();
        for status in next.values_mut() {
            *status = ProjectStatus::Cloud;
        }
        for name in &local {
            next.insert(name.clone(), ProjectStatus::Local);
        }
        if let Some(backup_root) = &self.backup_root {
            match scan_project_dirs(backup_root) {
                Ok(remote) => {
                    for name in remote {
                        next.entry(name).or_insert(ProjectStatus::Cloud);
                    }
                }
                Err(e) => warn!(error = %e, "backup root scan failed"),
            }
        }

        if next != loaded {
            self.persist(&mut cache, &next)?;
        }
        Ok(next)
    }

    /// Reconciled registry as records sorted by name.
    pub fn records(&self) -> Result<Vec<ProjectRecord>, AgentError> {
        Ok(self
            .reconcile()?
            .into_iter()
            .map(|(name, status)| ProjectRecord { name, status })
            .collect())
    }

    /// Record a transition result.
    pub fn set_status(&self, name: &str, status: ProjectStatus) -> Result<(), AgentError> {
        let mut cache = self.lock();
        let mut map = self.load_known(&mut cache)?;
        if map.get(name) == Some(&status) {
            return Ok(());
        }
        map.insert(name.to_string(), status);
        self.persist(&mut cache, &map)
    }

    /// Drop a name from the registry. Touches nothing but the caches.
    pub fn forget(&self, name: &str) -> Result<bool, AgentError> {
        let mut cache = self.lock();
        let mut map = self.load_known(&mut cache)?;
        if map.remove(name).is_none() {
            return Ok(false);
        }
        self.persist(&mut cache, &map)?;
        Ok(true)
    }

    fn load_known(&self, cache: &mut Option<CachedMap>) -> Result<RegistryMap, AgentError> {
        let local_mtime = mtime(&self.local_cache);
        let cloud_path = self.cloud_cache();
        let cloud_mtime = cloud_path.as_deref().and_then(mtime);

        if let Some(cached) = cache.as_ref() {
            if cached.local_mtime == local_mtime && cached.cloud_mtime == cloud_mtime {
                return Ok(cached.map.clone());
            }
        }

        let mut map = RegistryMap::new();
        if let Some(cloud_path) = &cloud_path {
            match read_map(cloud_path) {
                Ok(cloud) => map.extend(cloud),
                Err(e) => warn!(path = %cloud_path.display(), error = %e, "ignoring cloud registry cache"),
            }
        }
        map.extend(read_map(&self.local_cache)?);

        *cache = Some(CachedMap {
            map: map.clone(),
            local_mtime,
            cloud_mtime,
        });
        Ok(map)
    }

    fn persist(&self, cache: &mut Option<CachedMap>, map: &RegistryMap) -> Result<(), AgentError> {
        write_map(&self.local_cache, map)?;
        if let Some(cloud_path) = self.cloud_cache() {
            if let Err(e) = write_map(&cloud_path, map) {
                warn!(path = %cloud_path.display(), error = %e, "failed to mirror registry to backup root");
            }
        }
        debug!(entries = map.len(), "registry persisted");
        *cache = Some(CachedMap {
            map: map.clone(),
            local_mtime: mtime(&self.local_cache),
            cloud_mtime: self.cloud_cache().as_deref().and_then(mtime),
        });
        Ok(())
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_map(path: &Path) -> Result<RegistryMap, AgentError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RegistryMap::new()),
        Err(e) => return Err(AgentError::io("read registry", path, e)),
    };
    match serde_json::from_str(&raw) {
        Ok(map) => Ok(map),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "registry cache is corrupt, starting empty");
            Ok(RegistryMap::new())
        }
    }
}

fn write_map(path: &Path, map: &RegistryMap) -> Result<(), AgentError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AgentError::io("create registry folder", parent, e))?;
    }
    let json = serde_json::to_string_pretty(map)
        .map_err(|e| AgentError::io("encode registry", path, io::Error::other(e)))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| AgentError::io("write registry", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| AgentError::io("write registry", path, e))
}

/// Immediate subdirectory names of `root`. A missing root has none.
fn scan_project_dirs(root: &Path) -> Result<BTreeSet<String>, AgentError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(AgentError::io("scan projects", root, e)),
    };
    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|e| AgentError::io("scan projects", root, e))?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if IGNORED_DIRS.iter().any(|d| d.eq_ignore_ascii_case(&name)) {
            continue;
        }
        names.insert(name);
    }
    Ok(names)
}
