//! Local sessions: a shell child process supervised by one task.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use omni_common::config::ShellConfig;
use omni_common::{AgentError, ServerMessage};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{SessionCommand, SessionControl, SessionEvent};

const STDIN_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct LocalSpec {
    pub cmd: String,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Build the child command. The built-in shells fold stderr into stdout so
/// both arrive as one ordered stream.
pub fn shell_command(shell: &ShellConfig, spec: &LocalSpec) -> Command {
    let (program, args) = shell.resolved();
    let mut command = Command::new(&program);
    command.args(&args);

    if shell.program.is_some() {
        command.arg(&spec.cmd);
    } else {
        add_script(&mut command, &spec.cmd);
    }

    command
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    command
}

#[cfg(unix)]
fn add_script(command: &mut Command, cmd: &str) {
    command.arg(format!("exec 2>&1; {cmd}"));
}

#[cfg(windows)]
fn add_script(command: &mut Command, cmd: &str) {
    command.raw_arg(format!("({cmd}) 2>&1"));
}

/// Start the child and its supervisor task.
pub fn spawn(
    shell: &ShellConfig,
    session_id: String,
    spec: LocalSpec,
    events: mpsc::Sender<SessionEvent>,
) -> Result<SessionControl, AgentError> {
    let child = shell_command(shell, &spec).spawn().map_err(|e| {
        AgentError::SpawnFailure(format!("{} (cwd {}): {e}", spec.cmd, spec.cwd.display()))
    })?;
    let (control, commands) = SessionControl::channel();
    tokio::spawn(supervise(session_id, child, commands, events));
    Ok(control)
}

/// Drain output until both streams close, apply commands meanwhile, then
/// report the exit status.
async fn supervise(
    session_id: String,
    mut child: Child,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
) {
    let stdin = child.stdin.take().map(spawn_stdin_writer);
    let stdout = child.stdout.take().map(BufReader::new);
    let stderr = child.stderr.take().map(BufReader::new);

    let (delivered, terminated) = {
        let pumps = async {
            let (out, err) = tokio::join!(
                pump(&session_id, stdout, &events),
                pump(&session_id, stderr, &events)
            );
            out && err
        };
        tokio::pin!(pumps);

        let mut commands_open = true;
        let mut terminated = false;
        let delivered = loop {
            tokio::select! {
                delivered = &mut pumps => break delivered,
                command = commands.recv(), if commands_open => match command {
                    Some(SessionCommand::Stdin(data)) => {
                        let accepted = stdin.as_ref().is_some_and(|tx| tx.try_send(data).is_ok());
                        if !accepted {
                            let frame = ServerMessage::session_error(&session_id, "stdin failed");
                            let _ = events.send(SessionEvent::Frame(frame)).await;
                        }
                    }
                    Some(SessionCommand::Cancel) => {
                        if !terminated {
                            terminated = true;
                            terminate(&mut child).await;
                        }
                    }
                    None => {
                        commands_open = false;
                        if !terminated {
                            terminated = true;
                            terminate(&mut child).await;
                        }
                    }
                },
            }
        };
        (delivered, terminated)
    };
    drop(stdin);

    if !delivered && !terminated {
        debug!(session = %session_id, "connection gone; stopping child");
        terminate(&mut child).await;
    }

    let code = match child.wait().await {
        Ok(status) => status.code().map(|c| c.to_string()).unwrap_or_default(),
        Err(e) => {
            warn!(session = %session_id, error = %e, "failed to reap child");
            String::new()
        }
    };
    debug!(session = %session_id, code = %code, "local session exited");
    let _ = events
        .send(SessionEvent::Frame(ServerMessage::Exit {
            session_id,
            code,
        }))
        .await;
}

/// Forward one stream line by line. Returns false once the connection's
/// queue is gone.
async fn pump<R>(session_id: &str, reader: Option<R>, events: &mpsc::Sender<SessionEvent>) -> bool
where
    R: AsyncBufRead + Unpin,
{
    let Some(mut reader) = reader else {
        return true;
    };
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return true,
            Ok(_) => {
                let frame = ServerMessage::Output {
                    session_id: session_id.to_string(),
                    data: String::from_utf8_lossy(&buf).into_owned(),
                };
                if events.send(SessionEvent::Frame(frame)).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                debug!(session = %session_id, error = %e, "output stream failed");
                return true;
            }
        }
    }
}

fn spawn_stdin_writer(mut stdin: ChildStdin) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(STDIN_QUEUE);
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if stdin.write_all(data.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
                break;
            }
        }
    });
    tx
}

/// Ask the child (and everything it started) to stop. Falls back to the
/// runtime's kill when the request cannot be delivered.
async fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    match termination_request(pid).status().await {
        Ok(status) if status.success() => debug!(pid, "termination requested"),
        outcome => {
            warn!(pid, ?outcome, "termination request failed; killing");
            if let Err(e) = child.start_kill() {
                warn!(pid, error = %e, "kill failed");
            }
        }
    }
}

#[cfg(unix)]
fn termination_request(pid: u32) -> Command {
    let mut command = Command::new("kill");
    command
        .args(["-TERM", "--"])
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}

#[cfg(windows)]
fn termination_request(pid: u32) -> Command {
    let mut command = Command::new("taskkill");
    command
        .arg("/PID")
        .arg(pid.to_string())
        .args(["/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}
