//! Toolchain builds.

use std::time::Instant;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::Result;
use crate::events::Reporter;
use crate::exec::{self, Outcome};
use crate::output::Origin;
use crate::process::Project;
use crate::toolchain::Toolchain;

/// How a build ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Success,
    /// Non-zero exit; carries the captured stderr verbatim.
    Failed { stderr: String },
    /// Cancelled before completion. Not a failure.
    Killed,
}

/// Runs `<toolchain.program> <args>` in the project base.
///
/// The child sees the toolchain's bin variable pointing at
/// `<workspace>/bin` so built binaries land where the supervisor looks.
pub async fn compile(
    cancel: &CancellationToken,
    project: &Project,
    toolchain: &Toolchain,
    args: &[String],
) -> Result<BuildOutcome> {
    let mut command = Command::new(&toolchain.program);
    command.args(args).current_dir(&project.base);
    if let Some(bin) = toolchain.build_bin_dir() {
        command.env(&toolchain.bin_var, bin);
    }

    info!(project = %project.name, program = %toolchain.program, ?args, "building");
    let outcome = match exec::capture(command, cancel).await? {
        Outcome::Killed => BuildOutcome::Killed,
        Outcome::Completed(captured) if captured.success() => BuildOutcome::Success,
        Outcome::Completed(captured) => BuildOutcome::Failed {
            stderr: captured.stderr,
        },
    };
    Ok(outcome)
}

/// `compile` with progress and results reported as build records.
pub async fn compile_reported(
    cancel: &CancellationToken,
    project: &Project,
    toolchain: &Toolchain,
    reporter: &Reporter,
) -> Result<BuildOutcome> {
    reporter.log(Origin::Build, "Building...");
    let started = Instant::now();
    let outcome = compile(cancel, project, toolchain, &project.build_args).await;
    match &outcome {
        Ok(BuildOutcome::Success) => reporter.log(
            Origin::Build,
            format!("Built in {:.3} s", started.elapsed().as_secs_f64()),
        ),
        Ok(BuildOutcome::Failed { stderr }) => reporter.error(Origin::Build, stderr.trim_end()),
        Ok(BuildOutcome::Killed) => reporter.log(Origin::Build, "Killed"),
        Err(err) => reporter.error(Origin::Build, err.to_string()),
    }
    outcome
}
