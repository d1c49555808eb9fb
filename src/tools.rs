//! Auxiliary toolchain commands run concurrently across files.
//!
//! `invoke_tool` handles one (path, tool) pair and pushes a `ToolFailure` on
//! the result channel when the tool exits non-zero. `ToolBatch` launches many
//! invocations at once and joins them while draining the channel, so a full
//! channel can never stall the join.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::exec::{self, Outcome};
use crate::process::{Project, Tool, ToolFailure};
use crate::toolchain::Toolchain;

const RESULT_CAPACITY: usize = 8;

/// What a tool needs to know about the project it runs for.
#[derive(Debug, Clone)]
pub struct ToolScope {
    pub base: PathBuf,
    pub source_ext: String,
}

impl ToolScope {
    pub fn new(project: &Project, toolchain: &Toolchain) -> Self {
        Self {
            base: project.base.clone(),
            source_ext: toolchain.source_ext.clone(),
        }
    }
}

/// Working directory and arguments for one tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub dir: PathBuf,
    pub args: Vec<String>,
}

/// Decides where and how a tool runs against `path`, or `None` if the tool
/// does not apply.
///
/// A source file gets the file appended to the arguments (run from the
/// base), unless the tool is directory-scoped, in which case it runs in the
/// file's directory with its arguments untouched. A path without an extension
/// is a root scope: the tool runs inside it, or in its containing directory
/// when directory-scoped.
pub fn plan(scope: &ToolScope, path: &Path, tool: &Tool) -> Option<Invocation> {
    match path.extension() {
        Some(ext) if ext.to_string_lossy() == scope.source_ext => {
            if tool.dir {
                let dir = path.parent().unwrap_or(&scope.base).to_path_buf();
                Some(Invocation {
                    dir,
                    args: tool.args.clone(),
                })
            } else {
                let mut args = tool.args.clone();
                args.push(path.to_string_lossy().into_owned());
                Some(Invocation {
                    dir: scope.base.clone(),
                    args,
                })
            }
        }
        Some(_) => None,
        None => {
            let dir = match path.parent() {
                Some(parent) if tool.dir => parent,
                _ => path,
            };
            Some(Invocation {
                dir: dir.to_path_buf(),
                args: tool.args.clone(),
            })
        }
    }
}

/// Runs a single tool against `path`.
///
/// Disabled or inapplicable tools return straight away. A cancelled run is
/// killed and reports nothing. Spawn failures are reported as failures so
/// the caller sees a misconfigured tool.
pub async fn invoke_tool(
    scope: &ToolScope,
    cancel: &CancellationToken,
    results: &mpsc::Sender<ToolFailure>,
    path: &Path,
    tool: Tool,
) {
    if !tool.enabled {
        return;
    }
    let Some(invocation) = plan(scope, path, &tool) else {
        return;
    };

    let mut command = Command::new(&tool.cmd);
    command.args(&invocation.args).current_dir(&invocation.dir);

    let output = match exec::capture(command, cancel).await {
        Ok(Outcome::Killed) => return,
        Ok(Outcome::Completed(captured)) if captured.success() => {
            debug!(tool = %tool.name, path = %path.display(), "tool passed");
            return;
        }
        Ok(Outcome::Completed(captured)) => captured.stderr + &captured.stdout,
        Err(err) => err.to_string(),
    };

    let failure = ToolFailure {
        tool: tool.name,
        path: path.to_path_buf(),
        output,
    };
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = results.send(failure) => {}
    }
}

/// Totals from a joined batch.
#[derive(Debug, Default)]
pub struct ToolReport {
    /// Invocations that finished, including disabled and skipped ones.
    pub completed: usize,
    pub failures: Vec<ToolFailure>,
}

/// A pool of concurrent tool invocations.
pub struct ToolBatch {
    scope: Arc<ToolScope>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    tx: mpsc::Sender<ToolFailure>,
    rx: mpsc::Receiver<ToolFailure>,
}

impl ToolBatch {
    pub fn new(scope: ToolScope, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(RESULT_CAPACITY);
        Self {
            scope: Arc::new(scope),
            cancel,
            tasks: JoinSet::new(),
            tx,
            rx,
        }
    }

    pub fn spawn(&mut self, path: PathBuf, tool: Tool) {
        let scope = self.scope.clone();
        let cancel = self.cancel.clone();
        let tx = self.tx.clone();
        self.tasks.spawn(async move {
            invoke_tool(&scope, &cancel, &tx, &path, tool).await;
        });
    }

    /// Every tool of `project` against every path.
    pub fn spawn_project(&mut self, project: &Project, paths: &[PathBuf]) {
        for path in paths {
            for tool in &project.tools {
                self.spawn(path.clone(), tool.clone());
            }
        }
    }

    /// Waits for every invocation, collecting failures as they arrive.
    pub async fn join(self) -> ToolReport {
        let ToolBatch {
            mut tasks,
            tx,
            mut rx,
            ..
        } = self;
        drop(tx);

        let mut report = ToolReport::default();
        loop {
            tokio::select! {
                Some(failure) = rx.recv() => report.failures.push(failure),
                joined = tasks.join_next() => match joined {
                    Some(Ok(())) => report.completed += 1,
                    Some(Err(err)) => {
                        warn!(error = %err, "tool task panicked");
                        report.completed += 1;
                    }
                    None => break,
                },
            }
        }
        while let Ok(failure) = rx.try_recv() {
            report.failures.push(failure);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(base: &Path) -> ToolScope {
        ToolScope {
            base: base.to_path_buf(),
            source_ext: "go".into(),
        }
    }

    fn tool(name: &str, cmd: &str, args: &[&str], dir: bool, enabled: bool) -> Tool {
        Tool {
            name: name.into(),
            cmd: cmd.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            dir,
            enabled,
        }
    }

    #[test]
    fn dir_scoped_tool_runs_in_file_directory() {
        let vet = tool("vet", "go", &["vet"], true, true);
        let invocation = plan(&scope(Path::new("/p")), Path::new("/p/pkg/x.go"), &vet).unwrap();
        assert_eq!(invocation.dir, PathBuf::from("/p/pkg"));
        assert_eq!(invocation.args, vec!["vet"]);
    }

    #[test]
    fn file_scoped_tool_gets_the_file_appended() {
        let fmt = tool("fmt", "gofmt", &["-s", "-w"], false, true);
        let invocation = plan(&scope(Path::new("/p")), Path::new("/p/pkg/x.go"), &fmt).unwrap();
        assert_eq!(invocation.dir, PathBuf::from("/p"));
        assert_eq!(invocation.args, vec!["-s", "-w", "/p/pkg/x.go"]);
    }

    #[test]
    fn root_scope_runs_in_the_directory() {
        let test = tool("test", "go", &["test"], false, true);
        let invocation = plan(&scope(Path::new("/p")), Path::new("/p"), &test).unwrap();
        assert_eq!(invocation.dir, PathBuf::from("/p"));
        assert_eq!(invocation.args, vec!["test"]);
    }

    #[test]
    fn dir_scoped_tool_on_a_root_runs_in_its_parent() {
        let vet = tool("vet", "go", &["vet"], true, true);
        let invocation = plan(&scope(Path::new("/p")), Path::new("/p/pkg"), &vet).unwrap();
        assert_eq!(invocation.dir, PathBuf::from("/p"));
        assert_eq!(invocation.args, vec!["vet"]);
    }

    #[test]
    fn other_extensions_do_not_apply() {
        let fmt = tool("fmt", "gofmt", &["-w"], false, true);
        assert!(plan(&scope(Path::new("/p")), Path::new("/p/readme.md"), &fmt).is_none());
    }

    #[tokio::test]
    async fn disabled_tools_complete_without_results() {
        let mut batch = ToolBatch::new(scope(Path::new("/p")), CancellationToken::new());
        for n in 0..5 {
            batch.spawn(
                PathBuf::from(format!("/p/f{n}.go")),
                tool("vet", "/definitely/not/here", &[], false, false),
            );
        }
        let report = batch.join().await;
        assert_eq!(report.completed, 5);
        assert!(report.failures.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failures_are_reported_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = ToolBatch::new(scope(dir.path()), CancellationToken::new());
        batch.spawn(
            dir.path().to_path_buf(),
            tool("fails", "sh", &["-c", "echo E >&2; echo O; exit 1"], false, true),
        );
        batch.spawn(dir.path().to_path_buf(), tool("passes", "true", &[], false, true));

        let report = batch.join().await;
        assert_eq!(report.completed, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].tool, "fails");
        assert_eq!(report.failures[0].output, "E\nO\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn many_failures_do_not_deadlock_the_join() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = ToolBatch::new(scope(dir.path()), CancellationToken::new());
        for _ in 0..(RESULT_CAPACITY * 3) {
            batch.spawn(dir.path().to_path_buf(), tool("false", "false", &[], false, true));
        }
        let report = tokio::time::timeout(std::time::Duration::from_secs(20), batch.join())
            .await
            .expect("join stalled");
        assert_eq!(report.completed, RESULT_CAPACITY * 3);
        assert_eq!(report.failures.len(), RESULT_CAPACITY * 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_tools_emit_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut batch = ToolBatch::new(scope(dir.path()), cancel.clone());
        batch.spawn(
            dir.path().to_path_buf(),
            tool("slow", "sh", &["-c", "sleep 30; exit 1"], false, true),
        );
        cancel.cancel();
        let report = batch.join().await;
        assert_eq!(report.completed, 1);
        assert!(report.failures.is_empty());
    }
}
