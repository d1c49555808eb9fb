//! Subprocess plumbing shared by builds, tools, commands and runs.
//!
//! Everything here follows one rule: a wait on a child always races the
//! cancellation token, and losing that race means a forced kill.

use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{Result, SupervisorError};

/// Result of waiting on something that can be cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The process ran to completion.
    Completed(T),
    /// Cancellation fired first and the process was killed.
    Killed,
}

/// Output of a process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Human-readable program name of a command, for errors and logs.
pub fn program_name(command: &Command) -> String {
    command.as_std().get_program().to_string_lossy().into_owned()
}

/// Configures stdout and stderr as pipes and detaches stdin.
pub fn piped(command: &mut Command) -> &mut Command {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
}

/// Puts the child in its own process group so terminal signals aimed at the
/// supervisor do not reach it directly.
pub fn isolate(command: &mut Command) -> &mut Command {
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }
    command
}

pub fn spawn(command: &mut Command) -> Result<Child> {
    command.spawn().map_err(|source| SupervisorError::Spawn {
        program: program_name(command),
        source,
    })
}

/// Sends SIGKILL to the process group led by `pid`, the id of an `isolate`d
/// child, so helpers it forked do not keep its output pipes open. The group
/// outlives its leader, so a pid recorded at spawn stays usable after the
/// child itself has been reaped.
pub fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            unsafe {
                let _ = libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Force-kills a child and reaps it.
pub async fn kill(child: &mut Child, program: &str) -> Result<()> {
    child.kill().await.map_err(|source| SupervisorError::Kill {
        program: program.to_string(),
        source,
    })
}

/// Runs a command to completion with both streams captured in memory.
///
/// Completion means the child has exited and both streams reached end of
/// file; a forked helper holding a pipe keeps the capture open. Returns
/// `Outcome::Killed` as soon as `cancel` fires at any point before that,
/// after killing the child's process group. Spawn and kill failures are
/// errors; a non-zero exit is not.
pub async fn capture(mut command: Command, cancel: &CancellationToken) -> Result<Outcome<Captured>> {
    let program = program_name(&command);
    let mut child = spawn(isolate(piped(&mut command)))?;
    let pid = child.id();
    let stdout = child.stdout.take().map(collect);
    let stderr = child.stderr.take().map(collect);
    let collectors: Vec<AbortHandle> = stdout
        .iter()
        .chain(stderr.iter())
        .map(JoinHandle::abort_handle)
        .collect();

    let finished = tokio::select! {
        _ = cancel.cancelled() => None,
        done = finish(&mut child, stdout, stderr) => Some(done),
    };

    match finished {
        Some(done) => {
            let captured = done?;
            debug!(%program, status = ?captured.status, "exited");
            Ok(Outcome::Completed(captured))
        }
        None => {
            debug!(%program, "cancelled; killing");
            kill_group(pid);
            if child.try_wait()?.is_none() {
                kill(&mut child, &program).await?;
            }
            for collector in collectors {
                collector.abort();
            }
            Ok(Outcome::Killed)
        }
    }
}

async fn finish(
    child: &mut Child,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
) -> Result<Captured> {
    let status = child.wait().await?;
    let (stdout, stderr) = tokio::join!(join(stdout), join(stderr));
    Ok(Captured {
        status,
        stdout,
        stderr,
    })
}

fn collect<R>(mut reader: R) -> JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn join(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}
