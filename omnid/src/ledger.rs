//! Resource backup/restore ledger.
//!
//! Before a project leaves the machine, every external and app-state path its
//! manifest declares is moved into `<project>/_omni_assets/<id>`, where `id`
//! is the BLAKE3 digest of the original absolute path. The ledger file
//! (`restore_map.json`) maps ids back to original paths and travels with the
//! project tree. Restoring replays it and then empties it, so a second
//! restore is a no-op.
//!
//! Each resource yields a [`ResourceStep`]; the caller decides which outcomes
//! are fatal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use omni_common::types::{ASSETS_DIR, QUARANTINE_DIR, RESTORE_MAP_FILE};
use omni_common::{AgentError, PathSafetyPolicy, RestoreMap, restore_id};
use serde::Serialize;
use tracing::{info, warn};

use crate::fsops::{move_path, remove_tree_force};

// ── Step outcomes ───────────────────────────────────────────────────────

/// What happened to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Moved into the assets folder.
    Stored,
    /// Moved back to its original path.
    Restored,
    /// Not present on disk; nothing to do.
    Missing,
    /// A blob for this path is already waiting in the ledger.
    AlreadyStored,
    /// Could not be restored; parked under `_omni_assets/_restored/`.
    Quarantined { reason: String },
    /// Could not be restored or quarantined; kept in the ledger.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceStep {
    pub id: String,
    pub original: PathBuf,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerReport {
    pub steps: Vec<ResourceStep>,
}

impl LedgerReport {
    pub fn count(&self, pred: impl Fn(&StepOutcome) -> bool) -> usize {
        self.steps.iter().filter(|s| pred(&s.outcome)).count()
    }

    pub fn quarantined(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::Quarantined { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::Failed { .. }))
    }
}

// ── Ledger ──────────────────────────────────────────────────────────────

/// Ledger for one project directory.
#[derive(Debug, Clone)]
pub struct RestoreLedger {
    project_dir: PathBuf,
    assets_dir: PathBuf,
    map_path: PathBuf,
}

impl RestoreLedger {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let assets_dir = project_dir.join(ASSETS_DIR);
        let map_path = assets_dir.join(RESTORE_MAP_FILE);
        Self {
            project_dir,
            assets_dir,
            map_path,
        }
    }

    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    /// Current ledger contents; empty when no ledger file exists.
    pub fn load(&self) -> Result<RestoreMap, AgentError> {
        let raw = match fs::read_to_string(&self.map_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RestoreMap::new()),
            Err(e) => return Err(AgentError::io("read restore ledger", &self.map_path, e)),
        };
        serde_json::from_str(&raw).map_err(|e| {
            AgentError::io(
                "parse restore ledger",
                &self.map_path,
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })
    }

    fn save(&self, map: &RestoreMap) -> Result<(), AgentError> {
        fs::create_dir_all(&self.assets_dir)
            .map_err(|e| AgentError::io("create assets folder", &self.assets_dir, e))?;
        let json = serde_json::to_string_pretty(map)
            .map_err(|e| AgentError::io("encode restore ledger", &self.map_path, io::Error::other(e)))?;
        let tmp = self.map_path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| AgentError::io("write restore ledger", &tmp, e))?;
        fs::rename(&tmp, &self.map_path)
            .map_err(|e| AgentError::io("write restore ledger", &self.map_path, e))
    }

    /// Move `resources` into the assets folder and record them.
    ///
    /// Every path is Guard-checked before anything moves; one unsafe entry
    /// rejects the whole batch. A failed move aborts with the ledger saved
    /// up to the last successful step.
    pub fn backup(
        &self,
        resources: &[PathBuf],
        guard: &PathSafetyPolicy,
    ) -> Result<LedgerReport, AgentError> {
        let mut checked = Vec::with_capacity(resources.len());
        for resource in resources {
            let normalized = guard.ensure_safe(resource)?;
            if self.project_dir.starts_with(&normalized) || normalized.starts_with(&self.assets_dir)
            {
                return Err(AgentError::InvalidManifest {
                    path: self.project_dir.join(omni_common::types::MANIFEST_FILE),
                    message: format!("resource {} overlaps the project", normalized.display()),
                });
            }
            checked.push(normalized);
        }

        let mut map = self.load()?;
        let mut report = LedgerReport::default();

        for original in checked {
            let id = restore_id(&original);
            let step = |outcome| ResourceStep {
                id: id.clone(),
                original: original.clone(),
                outcome,
            };

            if fs::symlink_metadata(&original).is_err() {
                report.steps.push(step(StepOutcome::Missing));
                continue;
            }

            let slot = self.assets_dir.join(&id);
            if map.contains_key(&id) && fs::symlink_metadata(&slot).is_ok() {
                warn!(path = %original.display(), "resource already stored, leaving live copy in place");
                report.steps.push(step(StepOutcome::AlreadyStored));
                continue;
            }
            // Orphaned slot from an interrupted run.
            remove_tree_force(&slot)?;

            move_path(&original, &slot)?;
            map.insert(id.clone(), original.clone());
            self.save(&map)?;
            info!(path = %original.display(), id = %id, "stored resource");
            report.steps.push(step(StepOutcome::Stored));
        }

        Ok(report)
    }

    /// Move every stored blob back to its original path.
    ///
    /// Originals that fail the Guard, or whose move fails, are quarantined
    /// instead. The ledger is emptied afterwards (only `Failed` entries stay)
    /// and the assets folder is removed once nothing else is left in it.
    pub fn restore(&self, guard: &PathSafetyPolicy) -> Result<LedgerReport, AgentError> {
        let map = self.load()?;
        let mut report = LedgerReport::default();
        if map.is_empty() {
            return Ok(report);
        }

        let mut remaining = RestoreMap::new();
        for (id, original) in map {
            let blob = self.assets_dir.join(&id);
            let outcome = if fs::symlink_metadata(&blob).is_err() {
                StepOutcome::Missing
            } else {
                let attempt = guard
                    .ensure_safe(&original)
                    .and_then(|target| move_path(&blob, &target));
                match attempt {
                    Ok(()) => {
                        info!(path = %original.display(), "restored resource");
                        StepOutcome::Restored
                    }
                    Err(reason) => {
                        warn!(path = %original.display(), error = %reason, "restore failed, quarantining");
                        match self.quarantine(&id, &blob) {
                            Ok(()) => StepOutcome::Quarantined {
                                reason: reason.to_string(),
                            },
                            Err(e) => {
                                remaining.insert(id.clone(), original.clone());
                                StepOutcome::Failed {
                                    reason: format!("{reason}; quarantine failed: {e}"),
                                }
                            }
                        }
                    }
                }
            };
            report.steps.push(ResourceStep {
                id,
                original,
                outcome,
            });
        }

        if remaining.is_empty() {
            self.discard_ledger()?;
        } else {
            self.save(&remaining)?;
        }
        Ok(report)
    }

    fn quarantine(&self, id: &str, blob: &Path) -> Result<(), AgentError> {
        let folder = self.assets_dir.join(QUARANTINE_DIR);
        let mut target = folder.join(id);
        let mut n = 1;
        while fs::symlink_metadata(&target).is_ok() {
            target = folder.join(format!("{id}.{n}"));
            n += 1;
        }
        move_path(blob, &target)
    }

    fn discard_ledger(&self) -> Result<(), AgentError> {
        match fs::remove_file(&self.map_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(AgentError::io("remove restore ledger", &self.map_path, e)),
        }
        let empty = fs::read_dir(&self.assets_dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty {
            fs::remove_dir(&self.assets_dir)
                .map_err(|e| AgentError::io("remove assets folder", &self.assets_dir, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        project: PathBuf,
        external: PathBuf,
        guard: PathSafetyPolicy,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let workspace = tmp.path().join("workspace");
        let external = tmp.path().join("external");
        let project = workspace.join("demo");
        fs::create_dir_all(&project).unwrap();
        fs::create_dir_all(&external).unwrap();
        let guard = PathSafetyPolicy::new(&workspace).with_allow_roots([&external]);
        Fixture {
            _tmp: tmp,
            project,
            external,
            guard,
        }
    }

    #[test]
    fn backup_then_restore_returns_resources_to_original_paths() {
        let fx = fixture();
        let file = fx.external.join("settings/app.ini");
        let dir = fx.external.join("emulator");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "theme=dark").unwrap();
        fs::create_dir_all(dir.join("avd")).unwrap();
        fs::write(dir.join("avd/config.ini"), "ram=2048").unwrap();

        let ledger = RestoreLedger::new(&fx.project);
        let report = ledger
            .backup(&[file.clone(), dir.clone()], &fx.guard)
            .unwrap();
        assert_eq!(report.count(|o| *o == StepOutcome::Stored), 2);
        assert!(!file.exists());
        assert!(!dir.exists());
        assert_eq!(ledger.load().unwrap().len(), 2);
        assert!(ledger.assets_dir().join(restore_id(&file)).is_file());

        let report = ledger.restore(&fx.guard).unwrap();
        assert_eq!(report.count(|o| *o == StepOutcome::Restored), 2);
        assert_eq!(fs::read_to_string(&file).unwrap(), "theme=dark");
        assert_eq!(fs::read_to_string(dir.join("avd/config.ini")).unwrap(), "ram=2048");
        assert!(!ledger.assets_dir().exists());

        let again = ledger.restore(&fx.guard).unwrap();
        assert!(again.steps.is_empty());
        assert_eq!(fs::read_to_string(&file).unwrap(), "theme=dark");
    }

    #[test]
    fn unsafe_resource_rejects_batch_before_any_move() {
        let fx = fixture();
        let ok = fx.external.join("ok.txt");
        fs::write(&ok, "x").unwrap();

        let ledger = RestoreLedger::new(&fx.project);
        let err = ledger
            .backup(&[ok.clone(), PathBuf::from("/etc/passwd")], &fx.guard)
            .unwrap_err();
        assert_eq!(err.code(), "unsafe_path");
        assert!(ok.exists());
        assert!(!ledger.assets_dir().exists());
    }

    #[test]
    fn resource_containing_project_is_rejected() {
        let fx = fixture();
        let ledger = RestoreLedger::new(&fx.project);
        let parent = fx.project.parent().unwrap().to_path_buf();
        let err = ledger.backup(&[parent], &fx.guard).unwrap_err();
        assert_eq!(err.code(), "invalid_manifest");
    }

    #[test]
    fn missing_resources_are_skipped() {
        let fx = fixture();
        let ledger = RestoreLedger::new(&fx.project);
        let report = ledger
            .backup(&[fx.external.join("nope")], &fx.guard)
            .unwrap();
        assert_eq!(report.steps[0].outcome, StepOutcome::Missing);
        assert!(ledger.load().unwrap().is_empty());
    }

    #[test]
    fn backup_merges_with_existing_ledger() {
        let fx = fixture();
        let a = fx.external.join("a");
        let b = fx.external.join("b");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();

        let ledger = RestoreLedger::new(&fx.project);
        ledger.backup(&[a.clone()], &fx.guard).unwrap();
        ledger.backup(&[b.clone()], &fx.guard).unwrap();
        let map = ledger.load().unwrap();
        assert_eq!(map.get(&restore_id(&a)), Some(&a));
        assert_eq!(map.get(&restore_id(&b)), Some(&b));
    }

    #[test]
    fn restore_to_now_unsafe_path_is_quarantined() {
        let fx = fixture();
        let file = fx.external.join("secret.cfg");
        fs::write(&file, "s").unwrap();
        let ledger = RestoreLedger::new(&fx.project);
        ledger.backup(&[file.clone()], &fx.guard).unwrap();

        let strict = PathSafetyPolicy::new(fx.project.parent().unwrap());
        let report = ledger.restore(&strict).unwrap();
        assert_eq!(report.quarantined(), 1);
        assert!(!file.exists());
        let parked = ledger
            .assets_dir()
            .join(QUARANTINE_DIR)
            .join(restore_id(&file));
        assert_eq!(fs::read_to_string(parked).unwrap(), "s");
        assert!(ledger.load().unwrap().is_empty());
    }

    #[test]
    fn restore_never_overwrites_an_occupied_path() {
        let fx = fixture();
        let file = fx.external.join("prefs.json");
        fs::write(&file, "old").unwrap();
        let ledger = RestoreLedger::new(&fx.project);
        ledger.backup(&[file.clone()], &fx.guard).unwrap();
        fs::write(&file, "recreated").unwrap();

        let report = ledger.restore(&fx.guard).unwrap();
        assert_eq!(report.quarantined(), 1);
        assert_eq!(fs::read_to_string(&file).unwrap(), "recreated");
    }
}
