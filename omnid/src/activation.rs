//! Activation State Machine: moves a project between the workspace (Local)
//! and the backup root (Cloud).
//!
//! Transitions are serialized per project name and fail fast on
//! contention. Destructive steps run only after the constructive step they
//! depend on has been confirmed: the local tree is deleted after the backup
//! copy is verified, and a project is marked Local only after its resources
//! were restored. The backup copy is built in a staging folder and swapped
//! in whole, so it never keeps files or ledgers from an earlier cycle.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use omni_common::types::CLOUD_META_DIR;
use omni_common::{AgentError, ProjectManifest, ProjectStatus, validate_project_name};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::context::AgentContext;
use crate::events::{PROJECT_ACTIVATED, PROJECT_DEACTIVATED};
use crate::fsops::{CopyStats, copy_tree, is_copy_noise, remove_tree_force, replace_dir};
use crate::ledger::{LedgerReport, RestoreLedger};
use crate::software::{SoftwareStep, ensure_installed, remove_unused};

/// Outcome of a successful transition.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionReport {
    pub project: String,
    pub status: ProjectStatus,
    pub resources: LedgerReport,
    pub software: Vec<SoftwareStep>,
    pub copied_files: u64,
    pub copied_bytes: u64,
}

impl TransitionReport {
    fn new(project: &str, status: ProjectStatus, copy: CopyStats) -> Self {
        Self {
            project: project.to_string(),
            status,
            resources: LedgerReport::default(),
            software: Vec::new(),
            copied_files: copy.files,
            copied_bytes: copy.bytes,
        }
    }
}

/// Local to Cloud.
pub async fn deactivate(ctx: Arc<AgentContext>, name: String) -> Result<TransitionReport, AgentError> {
    run_transition(ctx, name, deactivate_locked).await
}

/// Cloud to Local.
pub async fn activate(ctx: Arc<AgentContext>, name: String) -> Result<TransitionReport, AgentError> {
    run_transition(ctx, name, activate_locked).await
}

/// Take the project lock on the caller's task, then run the blocking body.
async fn run_transition(
    ctx: Arc<AgentContext>,
    name: String,
    body: fn(&AgentContext, &str) -> Result<TransitionReport, AgentError>,
) -> Result<TransitionReport, AgentError> {
    validate_project_name(&name)?;
    let lock = ctx.locks.try_acquire(&name)?;
    tokio::task::spawn_blocking(move || {
        let _lock = lock;
        body(&ctx, &name)
    })
    .await
    .map_err(|e| AgentError::SpawnFailure(format!("transition task failed: {e}")))?
}

fn deactivate_locked(ctx: &AgentContext, name: &str) -> Result<TransitionReport, AgentError> {
    let local_dir = ctx.config.paths.workspace_root.join(name);
    if !local_dir.is_dir() {
        return Err(AgentError::not_found("project", name));
    }
    let local_dir = ctx.guard.ensure_safe(&local_dir)?;
    let backup_root = ctx
        .config
        .paths
        .backup_root
        .as_deref()
        .ok_or(AgentError::NotConfigured)?;
    let backup_dir = ctx.guard.ensure_safe(backup_root.join(name))?;
    let meta_dir = backup_root.join(CLOUD_META_DIR);
    let staging = ctx.guard.ensure_safe(meta_dir.join("staging").join(name))?;
    let retired = ctx.guard.ensure_safe(meta_dir.join("retired").join(name))?;
    let manifest = ProjectManifest::load(&local_dir)?;

    info!(project = %name, "deactivating project");
    let ledger = RestoreLedger::new(&local_dir);
    let resources: Vec<PathBuf> = manifest.resource_paths().cloned().collect();
    let resource_report = ledger.backup(&resources, &ctx.guard)?;

    let software = match &ctx.packages {
        Some(pm) if ctx.config.software.uninstall_unused && !manifest.software.is_empty() => {
            match software_needed_elsewhere(ctx, name) {
                Some(needed) => remove_unused(pm.as_ref(), &manifest.software, &needed),
                None => Vec::new(),
            }
        }
        _ => Vec::new(),
    };

    let copied = remove_tree_force(&staging)
        .and_then(|()| copy_tree(&local_dir, &staging))
        .and_then(|stats| verify_copy(&local_dir, &staging).map(|()| stats))
        .and_then(|stats| replace_dir(&staging, &backup_dir, &retired).map(|()| stats));
    let stats = match copied {
        Ok(stats) => stats,
        Err(e) => {
            warn!(project = %name, error = %e, "backup copy failed; keeping local tree");
            rollback_deactivate(ctx, &ledger, &staging);
            return Err(e);
        }
    };

    remove_tree_force(&local_dir)?;
    ctx.registry.set_status(name, ProjectStatus::Cloud)?;
    ctx.events
        .emit(PROJECT_DEACTIVATED, &json!({ "project": name }));
    info!(project = %name, files = stats.files, "project deactivated");

    let mut report = TransitionReport::new(name, ProjectStatus::Cloud, stats);
    report.resources = resource_report;
    report.software = software;
    Ok(report)
}

fn activate_locked(ctx: &AgentContext, name: &str) -> Result<TransitionReport, AgentError> {
    let backup_root = ctx
        .config
        .paths
        .backup_root
        .as_deref()
        .ok_or(AgentError::NotConfigured)?;
    let backup_dir = backup_root.join(name);
    if !backup_dir.is_dir() {
        return Err(AgentError::not_found("backup", name));
    }
    let backup_dir = ctx.guard.ensure_safe(&backup_dir)?;
    let workspace_root = &ctx.config.paths.workspace_root;
    let local_dir = ctx.guard.ensure_safe(workspace_root.join(name))?;
    if fs::symlink_metadata(&local_dir).is_ok() {
        return Err(AgentError::InvalidRequest(format!(
            "project {name} is already local"
        )));
    }

    info!(project = %name, "activating project");
    let discard_partial = |e: AgentError| {
        if let Err(cleanup) = remove_tree_force(&local_dir) {
            warn!(project = %name, error = %cleanup, "could not remove partial copy");
        }
        e
    };

    let stats = fs::create_dir_all(workspace_root)
        .map_err(|e| AgentError::io("create workspace root", workspace_root, e))
        .and_then(|()| copy_tree(&backup_dir, &local_dir))
        .map_err(discard_partial)?;
    let ledger = RestoreLedger::new(&local_dir);
    let resources = ledger.restore(&ctx.guard).map_err(discard_partial)?;
    if resources.quarantined() > 0 {
        warn!(
            project = %name,
            count = resources.quarantined(),
            dir = %ledger.assets_dir().display(),
            "resources quarantined during restore"
        );
    }

    let software = match ProjectManifest::load(&local_dir) {
        Ok(manifest) => match &ctx.packages {
            Some(pm) => ensure_installed(pm.as_ref(), &manifest.software),
            None => Vec::new(),
        },
        Err(e) => {
            warn!(project = %name, error = %e, "skipping software check");
            Vec::new()
        }
    };

    ctx.registry.set_status(name, ProjectStatus::Local)?;
    ctx.events.emit(PROJECT_ACTIVATED, &json!({ "project": name }));
    info!(project = %name, files = stats.files, "project activated");

    let mut report = TransitionReport::new(name, ProjectStatus::Local, stats);
    report.resources = resources;
    report.software = software;
    Ok(report)
}

/// Every top-level entry of `src` that is not copy noise exists in `dst`.
fn verify_copy(src: &Path, dst: &Path) -> Result<(), AgentError> {
    let entries = fs::read_dir(src).map_err(|e| AgentError::io("verify backup", src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| AgentError::io("verify backup", src, e))?;
        let name = entry.file_name();
        if is_copy_noise(&name) {
            continue;
        }
        let target = dst.join(&name);
        if fs::symlink_metadata(&target).is_err() {
            return Err(AgentError::io(
                "verify backup",
                &target,
                std::io::Error::new(std::io::ErrorKind::NotFound, "missing from backup"),
            ));
        }
    }
    Ok(())
}

/// Put stored resources back and drop the staged copy.
fn rollback_deactivate(ctx: &AgentContext, ledger: &RestoreLedger, staging: &Path) {
    match ledger.restore(&ctx.guard) {
        Ok(report) if report.quarantined() + report.failed() > 0 => {
            warn!(dir = %ledger.assets_dir().display(), "some resources could not be put back");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "could not put resources back"),
    }
    if let Err(e) = remove_tree_force(staging) {
        warn!(dir = %staging.display(), error = %e, "could not remove staged backup");
    }
}

/// Lowercase package ids declared by other Local projects; `None` when
/// that cannot be determined.
fn software_needed_elsewhere(ctx: &AgentContext, name: &str) -> Option<HashSet<String>> {
    let records = match ctx.registry.records() {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "registry unavailable; keeping all software");
            return None;
        }
    };
    let mut needed = HashSet::new();
    for record in records {
        if record.name == name || record.status != ProjectStatus::Local {
            continue;
        }
        let dir = ctx.config.paths.workspace_root.join(&record.name);
        match ProjectManifest::load(&dir) {
            Ok(manifest) => needed.extend(manifest.software.iter().map(|id| id.to_lowercase())),
            Err(e) => {
                warn!(project = %record.name, error = %e, "unreadable manifest; keeping all software");
                return None;
            }
        }
    }
    Some(needed)
}
