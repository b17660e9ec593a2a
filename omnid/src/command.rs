//! One-shot command execution for callers that don't need a live session.

use std::path::PathBuf;
use std::process::Stdio;

use omni_common::config::ShellConfig;
use omni_common::{AgentError, mask_sensitive_command, truncate_output};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::context::AgentContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub output: String,
}

/// Run `cmd` through the configured shell and capture its output.
pub async fn run_once(
    ctx: &AgentContext,
    cmd: &str,
    cwd: Option<&str>,
) -> Result<CommandOutput, AgentError> {
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return Err(AgentError::InvalidRequest("cmd is required".to_string()));
    }
    let dir = cwd
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| ctx.config.default_cwd());
    let dir = ctx.guard.ensure_safe(dir)?;

    info!(cmd = %mask_sensitive_command(cmd), cwd = %dir.display(), "running command");

    let output = capture_command(&ctx.config.shell, cmd)
        .current_dir(&dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            AgentError::SpawnFailure(format!(
                "{} (cwd {}): {e}",
                mask_sensitive_command(cmd),
                dir.display()
            ))
        })?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    let code = output.status.code();
    debug!(?code, bytes = text.len(), "command finished");

    Ok(CommandOutput {
        code,
        output: truncate_output(text),
    })
}

fn capture_command(shell: &ShellConfig, cmd: &str) -> Command {
    let (program, args) = shell.resolved();
    let mut command = Command::new(program);
    command.args(args);
    if shell.program.is_some() {
        command.arg(cmd);
    } else {
        add_script(&mut command, cmd);
    }
    command
}

#[cfg(unix)]
fn add_script(command: &mut Command, cmd: &str) {
    command.arg(cmd);
}

#[cfg(windows)]
fn add_script(command: &mut Command, cmd: &str) {
    command.raw_arg(cmd);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::context::testing::TestEnv;
    use omni_common::util::MAX_COMMAND_OUTPUT;
    use tempfile::TempDir;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let env = TestEnv::new();
        let ctx = env.context();
        let result = run_once(&ctx, "echo hi", None).await.unwrap();
        assert_eq!(
            result,
            CommandOutput {
                code: Some(0),
                output: "hi\n".into()
            }
        );
    }

    #[tokio::test]
    async fn stderr_follows_stdout() {
        let env = TestEnv::new();
        let ctx = env.context();
        let result = run_once(&ctx, "echo out; echo err 1>&2; exit 4", None)
            .await
            .unwrap();
        assert_eq!(result.code, Some(4));
        assert_eq!(result.output, "out\n\nerr\n");
    }

    #[tokio::test]
    async fn runs_in_the_requested_directory() {
        let env = TestEnv::new();
        let ctx = env.context();
        let sub = env.work().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let result = run_once(&ctx, "pwd", sub.to_str()).await.unwrap();
        assert_eq!(
            std::fs::canonicalize(result.output.trim()).unwrap(),
            std::fs::canonicalize(&sub).unwrap()
        );
    }

    #[tokio::test]
    async fn empty_command_and_unsafe_cwd_are_rejected() {
        let env = TestEnv::new();
        let ctx = env.context();

        let err = run_once(&ctx, "   ", None).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let outside = TempDir::new().unwrap();
        let err = run_once(&ctx, "true", outside.path().to_str()).await.unwrap_err();
        assert_eq!(err.code(), "unsafe_path");
    }

    #[tokio::test]
    async fn long_output_is_truncated() {
        let env = TestEnv::new();
        let ctx = env.context();
        let result = run_once(&ctx, "head -c 30000 /dev/zero | tr '\\0' a", None)
            .await
            .unwrap();
        assert!(result.output.ends_with("...truncated..."));
        assert!(result.output.starts_with(&"a".repeat(MAX_COMMAND_OUTPUT)));
    }
}
