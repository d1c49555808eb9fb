//! Supervision of a project's executable.
//!
//! `Supervisor::run` takes a project from `Located` through `Stopped`: it finds
//! the built binary, starts it, turns every output line into a `LogRecord`, and
//! kills the process once cancellation fires or either stream runs dry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{Result, SupervisorError};
use crate::events::Reporter;
use crate::exec;
use crate::output::{Level, Origin};
use crate::process::{Phase, Project};
use crate::toolchain::{self, Toolchain};

/// How long readers get to flush buffered lines after the kill.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Classifies stderr lines using the project's error pattern.
///
/// Lines that do not match are errors; lines that match are demoted to plain
/// output, which lets a pattern whitelist known-benign stderr chatter. With
/// no usable pattern nothing matches, so every stderr line is an error.
#[derive(Debug, Clone, Default)]
pub struct ErrorMatcher {
    regex: Option<Regex>,
}

impl ErrorMatcher {
    pub fn compile(pattern: &str) -> std::result::Result<Self, regex::Error> {
        if pattern.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self {
            regex: Some(Regex::new(pattern)?),
        })
    }

    pub fn matches(&self, line: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(line))
    }

    pub fn classify_stderr(&self, line: &str) -> Level {
        if self.matches(line) {
            Level::Out
        } else {
            Level::Error
        }
    }
}

/// Starts, streams and stops a project's executable.
pub struct Supervisor {
    bin_dir: Option<PathBuf>,
    suffixes: Vec<&'static str>,
    reporter: Reporter,
}

impl Supervisor {
    pub fn new(toolchain: &Toolchain, reporter: Reporter) -> Self {
        Self {
            bin_dir: toolchain.bin_dir(),
            suffixes: toolchain::exe_suffixes(),
            reporter,
        }
    }

    /// Overrides the binary-output directory read from the environment.
    #[cfg(test)]
    pub fn with_bin_dir(mut self, bin_dir: Option<PathBuf>) -> Self {
        self.bin_dir = bin_dir;
        self
    }

    /// Finds the project's executable and adopts it as `project.path`.
    pub fn locate(&self, project: &mut Project) -> Result<PathBuf> {
        let candidates = toolchain::candidate_paths(
            &project.base,
            &project.path,
            self.bin_dir.as_deref(),
            &self.suffixes,
        );
        match candidates.into_iter().find(|p| p.is_file()) {
            Some(found) => {
                debug!(project = %project.name, path = %found.display(), phase = ?Phase::Located);
                project.path = found.clone();
                Ok(found)
            }
            None => {
                self.reporter
                    .error(Origin::Supervisor, "Can't run a not compiled project");
                Err(SupervisorError::NotBuilt(project.name.clone()))
            }
        }
    }

    /// Runs the project until `cancel` fires or its output ends.
    ///
    /// `ready` is sent once the process has been spawned. If spawning fails it
    /// is dropped instead, so a waiting receiver wakes up with an error.
    pub async fn run(
        &self,
        project: &mut Project,
        cancel: CancellationToken,
        ready: oneshot::Sender<()>,
    ) -> Result<()> {
        let path = self.locate(project)?;

        let matcher = match ErrorMatcher::compile(&project.error_pattern) {
            Ok(matcher) => matcher,
            Err(err) => {
                self.reporter.error(Origin::Run, err.to_string());
                ErrorMatcher::default()
            }
        };

        debug!(project = %project.name, phase = ?Phase::Starting);
        let mut command = Command::new(&path);
        command.args(project.flat_args()).current_dir(&project.base);
        exec::isolate(exec::piped(&mut command));
        let program = path.display().to_string();
        let mut child = match exec::spawn(&mut command) {
            Ok(child) => child,
            Err(err) => {
                self.reporter.error(Origin::Run, err.to_string());
                return Err(err);
            }
        };
        let _ = ready.send(());
        info!(project = %project.name, pid = child.id().unwrap_or(0), phase = ?Phase::Running);

        let mut stdout = spawn_reader(child.stdout.take(), self.reporter.clone(), None);
        let mut stderr = spawn_reader(
            child.stderr.take(),
            self.reporter.clone(),
            Some(Arc::new(matcher)),
        );
        debug!(project = %project.name, phase = ?Phase::Streaming);

        tokio::select! {
            _ = cancel.cancelled() => debug!(project = %project.name, "stop requested"),
            _ = &mut stdout => debug!(project = %project.name, "stdout closed"),
            _ = &mut stderr => debug!(project = %project.name, "stderr closed"),
        }

        exec::kill_group(child.id());
        let killed = exec::kill(&mut child, &program).await;
        if let Err(err) = &killed {
            self.reporter
                .error(Origin::Run, format!("Failed to stop: {}", err));
        }
        drain(stdout).await;
        drain(stderr).await;
        self.reporter.log(Origin::Run, "Ended");
        info!(project = %project.name, phase = ?Phase::Stopped);
        killed
    }
}

fn spawn_reader<R>(
    reader: Option<R>,
    reporter: Reporter,
    matcher: Option<Arc<ErrorMatcher>>,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Some(reader) = reader {
            read_stream(reader, reporter, matcher).await;
        }
    })
}

async fn read_stream<R>(reader: R, reporter: Reporter, matcher: Option<Arc<ErrorMatcher>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(trim_newline(&buf)).into_owned();
        let level = match &matcher {
            Some(matcher) => matcher.classify_stderr(&line),
            None => Level::Out,
        };
        reporter.emit(Origin::Run, level, line);
    }
}

fn trim_newline(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

async fn drain(handle: JoinHandle<()>) {
    if handle.is_finished() {
        return;
    }
    let abort = handle.abort_handle();
    if tokio::time::timeout(DRAIN_GRACE, handle).await.is_err() {
        abort.abort();
    }
}
