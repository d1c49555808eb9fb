//! Data structures describing what gets supervised.
//!
//! A `Project` is the monitored unit. `Command`s and `Tool`s hang off it and
//! describe the ad-hoc and auxiliary toolchain commands run around a build.

use std::path::PathBuf;

/// A monitored project.
#[derive(Debug, Clone)]
pub struct Project {
    /// Friendly name, used to tag records.
    pub name: String,
    /// Directory builds, tools and commands run from.
    pub base: PathBuf,
    /// Executable path. Replaced in place once a binary is located on disk.
    pub path: PathBuf,
    /// Run-time arguments; each entry is split on whitespace.
    pub args: Vec<String>,
    /// Regex applied to stderr lines. Unmatched lines are errors.
    pub error_pattern: String,
    /// Whether to build before running.
    pub build: bool,
    /// Arguments passed to the toolchain build program.
    pub build_args: Vec<String>,
    /// Auxiliary tools run ahead of the build.
    pub tools: Vec<Tool>,
    /// Commands run before the build and after the run stops.
    pub commands: Vec<Command>,
}

impl Project {
    /// Run-time arguments flattened by whitespace.
    pub fn flat_args(&self) -> Vec<String> {
        self.args
            .iter()
            .flat_map(|arg| arg.split_whitespace().map(str::to_string))
            .collect()
    }

    pub fn commands_for(&self, stage: Stage) -> impl Iterator<Item = &Command> {
        self.commands.iter().filter(move |cmd| cmd.stage == stage)
    }
}

/// When a project command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Before tools and the build.
    Before,
    /// After the supervised process stops.
    After,
}

/// An ad-hoc command run for a project.
#[derive(Debug, Clone)]
pub struct Command {
    /// Command line. Quotes are stripped and the rest split on whitespace.
    pub cmd: String,
    /// Working directory override, relative to the project base unless it
    /// already lies under it.
    pub path: Option<PathBuf>,
    pub stage: Stage,
}

/// An auxiliary toolchain command (formatter, checker, generator).
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    /// Program to execute.
    pub cmd: String,
    pub args: Vec<String>,
    /// Operate on the containing directory instead of the file.
    pub dir: bool,
    pub enabled: bool,
}

/// A tool that exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    /// Name of the failing tool.
    pub tool: String,
    /// Target the tool ran against.
    pub path: PathBuf,
    /// Captured stderr followed by stdout.
    pub output: String,
}

/// Lifecycle of one supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Executable found on disk.
    Located,
    /// Process is being spawned.
    Starting,
    /// Process is alive.
    Running,
    /// Output readers are attached.
    Streaming,
    /// Process has been killed and torn down.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_args_split_each_entry() {
        let project = Project {
            name: "api".into(),
            base: PathBuf::from("/p"),
            path: PathBuf::from("api"),
            args: vec!["--port 8080".into(), "-v".into()],
            error_pattern: String::new(),
            build: true,
            build_args: vec!["install".into()],
            tools: Vec::new(),
            commands: vec![
                Command {
                    cmd: "make assets".into(),
                    path: None,
                    stage: Stage::Before,
                },
                Command {
                    cmd: "rm -rf tmp".into(),
                    path: None,
                    stage: Stage::After,
                },
            ],
        };
        assert_eq!(project.flat_args(), vec!["--port", "8080", "-v"]);
        let before: Vec<_> = project.commands_for(Stage::Before).map(|c| c.cmd.as_str()).collect();
        assert_eq!(before, vec!["make assets"]);
    }
}
