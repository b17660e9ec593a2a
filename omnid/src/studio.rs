//! Launching Android Studio on a project directory.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use omni_common::{AgentError, validate_project_name};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::context::AgentContext;

#[cfg(windows)]
const LAUNCHER_NAMES: &[&str] = &["studio64.exe", "studio.exe"];
#[cfg(not(windows))]
const LAUNCHER_NAMES: &[&str] = &["studio.sh", "studio"];

/// Standard install locations, most specific first.
fn install_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if cfg!(windows) {
        candidates.push(PathBuf::from(
            r"C:\Program Files\Android\Android Studio\bin\studio64.exe",
        ));
        if let Some(local) = env::var_os("LOCALAPPDATA") {
            candidates.push(
                PathBuf::from(local)
                    .join("Programs")
                    .join("Android Studio")
                    .join("bin")
                    .join("studio64.exe"),
            );
        }
    } else if cfg!(target_os = "macos") {
        candidates.push(PathBuf::from(
            "/Applications/Android Studio.app/Contents/MacOS/studio",
        ));
    } else {
        candidates.push(PathBuf::from("/opt/android-studio/bin/studio.sh"));
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join("android-studio").join("bin").join("studio.sh"));
        }
    }
    candidates
}

fn on_path(search: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    let search = search?;
    env::split_paths(search).find_map(|dir| {
        LAUNCHER_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

/// The configured launcher if it exists, else the first install location or
/// PATH entry that has one.
pub fn find_launcher(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        warn!(path = %path.display(), "configured IDE launcher does not exist");
    }
    install_candidates()
        .into_iter()
        .find(|candidate| candidate.is_file())
        .or_else(|| on_path(env::var_os("PATH").as_deref()))
}

/// Start the IDE on `project_dir` without waiting for it.
pub fn launch(launcher: &Path, project_dir: &Path) -> Result<u32, AgentError> {
    let mut child = Command::new(launcher)
        .arg(project_dir)
        .current_dir(project_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| AgentError::SpawnFailure(format!("{}: {e}", launcher.display())))?;
    let pid = child.id().unwrap_or_default();

    // Reap it so it never lingers as a zombie.
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!(pid, %status, "IDE launcher exited"),
            Err(e) => warn!(pid, error = %e, "failed to wait for IDE launcher"),
        }
    });
    Ok(pid)
}

/// Open a workspace project in the IDE. Returns the project directory.
pub fn open_studio(ctx: &AgentContext, name: &str) -> Result<PathBuf, AgentError> {
    validate_project_name(name)?;
    let project_dir = ctx.config.paths.workspace_root.join(name);
    if !project_dir.is_dir() {
        return Err(AgentError::not_found("project", name));
    }
    let project_dir = ctx.guard.ensure_safe(&project_dir)?;

    let launcher = find_launcher(ctx.config.ide.studio_command.as_deref())
        .ok_or_else(|| AgentError::not_found("IDE launcher", "Android Studio"))?;
    let pid = launch(&launcher, &project_dir)?;
    info!(project = %name, launcher = %launcher.display(), pid, "opened project in IDE");
    Ok(project_dir)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::context::testing::TestEnv;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn fake_launcher(dir: &Path, marker: &Path) -> PathBuf {
        let script = dir.join("studio.sh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$1\" > '{}'\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[test]
    fn launcher_is_found_on_path() {
        let bin = tempfile::TempDir::new().unwrap();
        let script = fake_launcher(bin.path(), &bin.path().join("marker"));
        let search = env::join_paths([PathBuf::from("/nonexistent"), bin.path().to_path_buf()])
            .unwrap();
        assert_eq!(on_path(Some(search.as_os_str())), Some(script));
        assert_eq!(on_path(None), None);
    }

    #[test]
    fn configured_launcher_wins() {
        let bin = tempfile::TempDir::new().unwrap();
        let script = fake_launcher(bin.path(), &bin.path().join("marker"));
        assert_eq!(find_launcher(Some(&script)), Some(script));
    }

    #[tokio::test]
    async fn opens_the_project_with_the_launcher() {
        let env = TestEnv::new();
        std::fs::create_dir(env.work().join("demo")).unwrap();
        let marker = env.ext().join("opened");
        let mut config = env.config();
        config.ide.studio_command = Some(fake_launcher(env.ext(), &marker));
        let ctx = AgentContext::new(config).unwrap();

        let dir = open_studio(&ctx, "demo").unwrap();
        assert_eq!(dir, ctx.guard.ensure_safe(env.work().join("demo")).unwrap());

        let mut opened = String::new();
        for _ in 0..50 {
            if let Ok(text) = std::fs::read_to_string(&marker) {
                if !text.is_empty() {
                    opened = text;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(PathBuf::from(opened.trim()), dir);
    }

    #[tokio::test]
    async fn missing_or_unsafe_projects_are_rejected() {
        let env = TestEnv::new();
        let ctx = env.context();

        assert_eq!(open_studio(&ctx, "ghost").unwrap_err().code(), "not_found");
        assert_eq!(open_studio(&ctx, "..").unwrap_err().code(), "unsafe_path");
    }
}
