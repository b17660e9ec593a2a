//! Software provisioning for project manifests.
//!
//! The package manager is a seam: production shells out to `winget`, tests
//! plug in a recording fake. Provisioning is best-effort; failures are
//! reported per package and never abort a transition.

use std::collections::HashSet;
use std::process::Command;

use omni_common::AgentError;
use serde::Serialize;
use tracing::{info, warn};

pub trait PackageManager: Send + Sync {
    /// Which of `wanted` are installed, compared case-insensitively. One
    /// inventory query per call.
    fn installed(&self, wanted: &[String]) -> Result<HashSet<String>, AgentError>;

    fn install(&self, id: &str) -> Result<(), AgentError>;

    fn uninstall(&self, id: &str) -> Result<(), AgentError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SoftwareAction {
    AlreadyPresent,
    Installed,
    Uninstalled,
    /// Still required by another local project.
    Kept,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoftwareStep {
    pub id: String,
    #[serde(flatten)]
    pub action: SoftwareAction,
}

fn valid_id(id: &str) -> bool {
    !id.is_empty() && !id.starts_with('-') && !id.chars().any(char::is_whitespace)
}

fn failed(id: &str, reason: impl ToString) -> SoftwareStep {
    SoftwareStep {
        id: id.to_string(),
        action: SoftwareAction::Failed {
            reason: reason.to_string(),
        },
    }
}

/// Install every id that is not already present.
pub fn ensure_installed(pm: &dyn PackageManager, ids: &[String]) -> Vec<SoftwareStep> {
    if ids.is_empty() {
        return Vec::new();
    }
    let (ids, invalid): (Vec<String>, Vec<String>) = ids.iter().cloned().partition(|id| valid_id(id));
    let mut steps: Vec<SoftwareStep> = invalid
        .iter()
        .map(|id| failed(id, "invalid package id"))
        .collect();

    let present = match pm.installed(&ids) {
        Ok(present) => present,
        Err(e) => {
            warn!(error = %e, "package inventory failed");
            steps.extend(ids.iter().map(|id| failed(id, &e)));
            return steps;
        }
    };

    for id in ids {
        if present.contains(&id.to_lowercase()) {
            steps.push(SoftwareStep {
                id,
                action: SoftwareAction::AlreadyPresent,
            });
            continue;
        }
        match pm.install(&id) {
            Ok(()) => {
                info!(package = %id, "installed package");
                steps.push(SoftwareStep {
                    id,
                    action: SoftwareAction::Installed,
                });
            }
            Err(e) => {
                warn!(package = %id, error = %e, "package install failed");
                steps.push(failed(&id, e));
            }
        }
    }
    steps
}

/// Uninstall ids that no other local project still requires.
///
/// `still_needed` holds lowercase ids.
pub fn remove_unused(
    pm: &dyn PackageManager,
    ids: &[String],
    still_needed: &HashSet<String>,
) -> Vec<SoftwareStep> {
    ids.iter()
        .map(|id| {
            if !valid_id(id) {
                return failed(id, "invalid package id");
            }
            if still_needed.contains(&id.to_lowercase()) {
                return SoftwareStep {
                    id: id.clone(),
                    action: SoftwareAction::Kept,
                };
            }
            match pm.uninstall(id) {
                Ok(()) => {
                    info!(package = %id, "uninstalled package");
                    SoftwareStep {
                        id: id.clone(),
                        action: SoftwareAction::Uninstalled,
                    }
                }
                Err(e) => {
                    warn!(package = %id, error = %e, "package uninstall failed");
                    failed(id, e)
                }
            }
        })
        .collect()
}

// ── winget ──────────────────────────────────────────────────────────────

/// `winget` driven through its CLI.
#[derive(Debug, Default, Clone)]
pub struct Winget;

impl Winget {
    fn run(&self, args: &[&str]) -> Result<std::process::Output, AgentError> {
        Command::new("winget")
            .args(args)
            .output()
            .map_err(|e| AgentError::SpawnFailure(format!("winget: {e}")))
    }
}

impl PackageManager for Winget {
    fn installed(&self, wanted: &[String]) -> Result<HashSet<String>, AgentError> {
        let output = self.run(&["list", "--accept-source-agreements"])?;
        let listing = String::from_utf8_lossy(&output.stdout).to_lowercase();
        Ok(wanted
            .iter()
            .map(|id| id.to_lowercase())
            .filter(|id| listing.split_whitespace().any(|token| token == id))
            .collect())
    }

    fn install(&self, id: &str) -> Result<(), AgentError> {
        let output = self.run(&[
            "install",
            "-e",
            "--id",
            id,
            "--silent",
            "--accept-package-agreements",
            "--accept-source-agreements",
        ])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AgentError::SpawnFailure(format!(
                "winget install {id} exited with {}",
                output.status
            )))
        }
    }

    fn uninstall(&self, id: &str) -> Result<(), AgentError> {
        let output = self.run(&["uninstall", "-e", "--id", id, "--silent"])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AgentError::SpawnFailure(format!(
                "winget uninstall {id} exited with {}",
                output.status
            )))
        }
    }
}
