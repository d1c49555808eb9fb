//! The top-level pipeline around the four core components.
//!
//! One run of a project is: before-commands, tools over the project root,
//! build, supervised run, after-commands. `supervise` repeats runs for every
//! project until a shutdown event arrives, restarting them all on request.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::run_command;
use crate::compile::{compile_reported, BuildOutcome};
use crate::errors::{Result, SupervisorError};
use crate::events::{Event, LogSink, Reporter};
use crate::exec::Outcome;
use crate::output::Origin;
use crate::process::{Project, Stage};
use crate::runner::Supervisor;
use crate::toolchain::Toolchain;
use crate::tools::{ToolBatch, ToolReport, ToolScope};

/// Runs the commands of one stage in order, stopping early on cancellation.
pub async fn run_commands(
    cancel: &CancellationToken,
    project: &Project,
    stage: Stage,
    reporter: &Reporter,
) -> bool {
    let mut all_ok = true;
    for command in project.commands_for(stage) {
        reporter.log(Origin::Command, format!("Running: {}", command.cmd));
        match run_command(cancel, &project.base, command).await {
            Ok(Outcome::Completed(output)) => {
                for line in output.stdout.lines() {
                    reporter.out(Origin::Command, line);
                }
                for line in output.stderr.lines() {
                    reporter.error(Origin::Command, line);
                }
                all_ok &= !output.failed();
            }
            Ok(Outcome::Killed) => return false,
            Err(err) => {
                reporter.error(Origin::Command, err.to_string());
                all_ok = false;
            }
        }
    }
    all_ok
}

/// Runs every tool of `project` against every path and reports failures.
pub async fn run_tools(
    cancel: &CancellationToken,
    project: &Project,
    toolchain: &Toolchain,
    paths: &[PathBuf],
    reporter: &Reporter,
) -> ToolReport {
    let mut batch = ToolBatch::new(ToolScope::new(project, toolchain), cancel.clone());
    batch.spawn_project(project, paths);
    let report = batch.join().await;
    debug!(
        project = %project.name,
        completed = report.completed,
        failed = report.failures.len(),
        "tools finished"
    );
    for failure in &report.failures {
        reporter.error(
            Origin::Tool,
            format!(
                "{} failed on {}: {}",
                failure.tool,
                failure.path.display(),
                failure.output.trim_end()
            ),
        );
    }
    report
}

/// One full run of a project.
///
/// `scope` ends this run (restart or shutdown); `hard` only cancels the
/// after-commands, which otherwise still run once the process has stopped.
pub async fn pipeline(
    scope: CancellationToken,
    hard: CancellationToken,
    mut project: Project,
    toolchain: Toolchain,
    reporter: Reporter,
) -> Result<()> {
    run_commands(&scope, &project, Stage::Before, &reporter).await;
    if scope.is_cancelled() {
        return Ok(());
    }

    if !project.tools.is_empty() {
        let roots = [project.base.clone()];
        run_tools(&scope, &project, &toolchain, &roots, &reporter).await;
    }

    if project.build {
        match compile_reported(&scope, &project, &toolchain, &reporter).await? {
            BuildOutcome::Success => {}
            BuildOutcome::Failed { .. } | BuildOutcome::Killed => return Ok(()),
        }
    }

    let supervisor = Supervisor::new(&toolchain, reporter.clone());
    let (ready_tx, ready_rx) = oneshot::channel();
    let announce = async {
        if ready_rx.await.is_ok() {
            reporter.log(Origin::Supervisor, "Running...");
        }
    };
    let (result, ()) = tokio::join!(supervisor.run(&mut project, scope.clone(), ready_tx), announce);

    run_commands(&hard, &project, Stage::After, &reporter).await;
    result
}

/// Supervises all projects until `Event::Shutdown` arrives or the event
/// channel closes.
///
/// A fatal error (binary missing, kill refused) stops every project and is
/// returned; anything else is left in the records and waits for a restart.
pub async fn supervise(
    projects: Vec<Project>,
    toolchain: Toolchain,
    sink: Arc<dyn LogSink>,
    mut events: mpsc::Receiver<Event>,
    hard: CancellationToken,
) -> Result<()> {
    loop {
        let scope = CancellationToken::new();
        let mut runs = JoinSet::new();
        for project in &projects {
            let reporter = Reporter::new(&project.name, sink.clone());
            runs.spawn(pipeline(
                scope.clone(),
                hard.clone(),
                project.clone(),
                toolchain.clone(),
                reporter,
            ));
        }

        let mut fatal = None;
        let event = loop {
            tokio::select! {
                event = events.recv() => break event.unwrap_or(Event::Shutdown),
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    if let Some(err) = settle(joined) {
                        fatal = Some(err);
                        break Event::Shutdown;
                    }
                }
            }
        };

        scope.cancel();
        while let Some(joined) = runs.join_next().await {
            if let Some(err) = settle(joined) {
                fatal.get_or_insert(err);
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        match event {
            Event::Restart => {
                info!("restarting all projects");
                for project in &projects {
                    Reporter::new(&project.name, sink.clone()).log(Origin::Supervisor, "Restarting...");
                }
            }
            Event::Shutdown => return Ok(()),
        }
    }
}

fn settle(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Option<SupervisorError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(err)) if err.is_fatal() => Some(err),
        Ok(Err(err)) => {
            warn!(error = %err, "run ended with an error");
            None
        }
        Err(err) => {
            warn!(error = %err, "run task panicked");
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::events::testing::{channel_reporter, drain};
    use crate::output::{Level, LogRecord};
    use crate::process::{Command, Tool};

    fn sh_toolchain() -> Toolchain {
        Toolchain {
            program: "sh".into(),
            source_ext: "sh".into(),
            workspace_var: "DEVRACK_TEST_NO_WORKSPACE".into(),
            bin_var: "DEVRACK_TEST_NO_BIN".into(),
        }
    }

    fn project(base: &Path) -> Project {
        let script = base.join("run.sh");
        std::fs::write(&script, "echo hello\nsleep 30\n").unwrap();
        Project {
            name: "api".into(),
            base: base.to_path_buf(),
            path: PathBuf::from("/bin/sh"),
            args: vec![script.display().to_string()],
            error_pattern: String::new(),
            build: false,
            build_args: Vec::new(),
            tools: Vec::new(),
            commands: Vec::new(),
        }
    }

    fn texts(records: &[LogRecord]) -> Vec<String> {
        records.iter().map(|r| r.text.clone()).collect()
    }

    #[tokio::test]
    async fn commands_report_output_by_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(dir.path());
        project.commands = vec![
            Command {
                cmd: "echo before".into(),
                path: None,
                stage: Stage::Before,
            },
            Command {
                cmd: "echo after".into(),
                path: None,
                stage: Stage::After,
            },
        ];
        let (reporter, mut rx) = channel_reporter("api");

        let ok = run_commands(&CancellationToken::new(), &project, Stage::Before, &reporter).await;
        assert!(ok);
        assert_eq!(texts(&drain(&mut rx)), vec!["Running: echo before", "before"]);
    }

    #[tokio::test]
    async fn tool_failures_become_error_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(dir.path());
        project.tools = vec![Tool {
            name: "lint".into(),
            cmd: "sh".into(),
            args: vec!["-c".into(), "echo bad >&2; exit 1".into()],
            dir: false,
            enabled: true,
        }];
        let (reporter, mut rx) = channel_reporter("api");

        let report = run_tools(
            &CancellationToken::new(),
            &project,
            &sh_toolchain(),
            &[dir.path().to_path_buf()],
            &reporter,
        )
        .await;
        assert_eq!(report.failures.len(), 1);

        let records = drain(&mut rx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].origin, Origin::Tool);
        assert_eq!(records[0].level, Level::Error);
        assert!(records[0].text.starts_with("lint failed on"));
    }

    #[tokio::test]
    async fn failed_build_skips_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(dir.path());
        project.build = true;
        project.build_args = vec!["-c".into(), "exit 1".into()];
        let (reporter, mut rx) = channel_reporter("api");

        pipeline(
            CancellationToken::new(),
            CancellationToken::new(),
            project,
            sh_toolchain(),
            reporter,
        )
        .await
        .unwrap();

        let records = drain(&mut rx);
        assert!(records.iter().all(|r| r.origin == Origin::Build));
    }

    #[tokio::test]
    async fn shutdown_stops_runs_and_after_commands_still_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(dir.path());
        project.commands = vec![Command {
            cmd: "echo cleanup".into(),
            path: None,
            stage: Stage::After,
        }];
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(4);

        let handle = tokio::spawn(supervise(
            vec![project],
            sh_toolchain(),
            Arc::new(tx),
            events_rx,
            CancellationToken::new(),
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        events_tx.send(Event::Restart).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        events_tx.send(Event::Shutdown).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("supervise did not stop")
            .unwrap()
            .unwrap();

        let mut records = Vec::new();
        while let Ok(record) = rx.try_recv() {
            records.push(record);
        }
        let texts = texts(&records);
        assert_eq!(texts.iter().filter(|t| *t == "Ended").count(), 2);
        assert_eq!(texts.iter().filter(|t| *t == "cleanup").count(), 2);
        assert!(texts.contains(&"Restarting...".to_string()));
    }

    #[test]
    fn kill_failures_are_fatal_and_spawn_failures_are_not() {
        let kill = SupervisorError::Kill {
            program: "api".into(),
            source: std::io::Error::other("denied"),
        };
        assert!(matches!(settle(Ok(Err(kill))), Some(SupervisorError::Kill { .. })));

        let spawn = SupervisorError::Spawn {
            program: "api".into(),
            source: std::io::Error::other("denied"),
        };
        assert!(settle(Ok(Err(spawn))).is_none());
        assert!(settle(Ok(Ok(()))).is_none());
    }

    #[tokio::test]
    async fn spawn_failure_waits_for_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(dir.path());
        // A plain file without the executable bit: found, but not startable.
        std::fs::write(dir.path().join("app"), "not a program").unwrap();
        project.path = PathBuf::from("app");
        project.args = Vec::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(4);

        let handle = tokio::spawn(supervise(
            vec![project],
            sh_toolchain(),
            Arc::new(tx),
            events_rx,
            CancellationToken::new(),
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_finished(), "spawn failure ended the session");

        events_tx.send(Event::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("supervise did not stop")
            .unwrap()
            .unwrap();

        let records = drain(&mut rx);
        assert!(records
            .iter()
            .any(|r| r.origin == Origin::Run && r.level == Level::Error));
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(dir.path());
        project.path = PathBuf::from("not-built");
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_events_tx, events_rx) = mpsc::channel(4);

        let err = supervise(
            vec![project],
            sh_toolchain(),
            Arc::new(tx),
            events_rx,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SupervisorError::NotBuilt(_)));
    }
}
