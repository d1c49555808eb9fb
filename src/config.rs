//! Configuration management for devrack.
//!
//! This module defines the structure of the `devrack.toml` configuration file
//! and turns it into the `Project` and `Toolchain` values the supervisor runs.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::process::{Command, Project, Stage, Tool};
use crate::toolchain::Toolchain;

/// Default file name looked up in the current directory.
pub const CONFIG_FILE: &str = "devrack.toml";

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Maximum number of records kept in memory per project and level.
    pub max_lines: Option<usize>,
    /// Whether to prepend an elapsed timestamp to printed records.
    pub timestamp: Option<bool>,
    /// Build and binary lookup settings.
    pub toolchain: Option<ToolchainConfig>,
    /// List of projects to supervise.
    #[serde(rename = "project", default)]
    pub projects: Vec<ProjectConfig>,
}

/// Overrides for the default (Go) toolchain.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolchainConfig {
    /// Build program.
    pub program: Option<String>,
    /// Source file extension, without the dot.
    pub source_ext: Option<String>,
    /// Environment variable naming the toolchain workspace.
    pub workspace_var: Option<String>,
    /// Environment variable naming the binary-output directory.
    pub bin_var: Option<String>,
}

/// Configuration for a single project.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Display name of the project.
    pub name: String,
    /// Project directory, relative to the config file (default: its directory).
    pub base: Option<String>,
    /// Executable path (default: the base directory's name).
    pub path: Option<String>,
    /// Arguments passed to the executable.
    pub args: Option<Vec<String>>,
    /// Regex for stderr lines that are *not* errors.
    pub error_pattern: Option<String>,
    /// Whether to build before running (default: true).
    pub build: Option<bool>,
    /// Arguments for the build program (default: `["install"]`).
    pub build_args: Option<Vec<String>>,
    /// Auxiliary tools.
    #[serde(rename = "tool", default)]
    pub tools: Vec<ToolConfig>,
    /// Before/after commands.
    #[serde(rename = "command", default)]
    pub commands: Vec<CommandConfig>,
}

/// Configuration for an auxiliary tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    /// Program to execute (default: the toolchain program).
    pub cmd: Option<String>,
    pub args: Option<Vec<String>>,
    /// Run in the containing directory instead of passing the file.
    pub dir: Option<bool>,
    /// Default: true.
    pub enabled: Option<bool>,
}

/// Configuration for a project command.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    pub cmd: String,
    /// Working directory, relative to the project base.
    pub path: Option<String>,
    /// `before` (default) or `after`.
    pub when: Option<When>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum When {
    Before,
    After,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

impl Config {
    pub fn toolchain(&self) -> Toolchain {
        let mut toolchain = Toolchain::default();
        if let Some(cfg) = &self.toolchain {
            if let Some(program) = &cfg.program {
                toolchain.program = program.clone();
            }
            if let Some(ext) = &cfg.source_ext {
                toolchain.source_ext = ext.trim_start_matches('.').to_string();
            }
            if let Some(var) = &cfg.workspace_var {
                toolchain.workspace_var = var.clone();
            }
            if let Some(var) = &cfg.bin_var {
                toolchain.bin_var = var.clone();
            }
        }
        toolchain
    }

    /// Resolves every project, with relative bases anchored at `root`.
    pub fn projects(&self, root: &Path, toolchain: &Toolchain) -> Result<Vec<Project>> {
        if self.projects.is_empty() {
            bail!("no projects defined");
        }
        self.projects
            .iter()
            .map(|cfg| cfg.resolve(root, toolchain))
            .collect()
    }
}

impl ProjectConfig {
    fn resolve(&self, root: &Path, toolchain: &Toolchain) -> Result<Project> {
        let base = match &self.base {
            Some(base) => root.join(base),
            None => root.to_path_buf(),
        };
        let path = match &self.path {
            Some(path) => PathBuf::from(path),
            None => base
                .file_name()
                .map(PathBuf::from)
                .with_context(|| format!("project {} needs a path", self.name))?,
        };
        let tools = self
            .tools
            .iter()
            .map(|tool| Tool {
                name: tool.name.clone(),
                cmd: tool.cmd.clone().unwrap_or_else(|| toolchain.program.clone()),
                args: tool.args.clone().unwrap_or_default(),
                dir: tool.dir.unwrap_or(false),
                enabled: tool.enabled.unwrap_or(true),
            })
            .collect();
        let commands = self
            .commands
            .iter()
            .map(|cmd| Command {
                cmd: cmd.cmd.clone(),
                path: cmd.path.as_ref().map(PathBuf::from),
                stage: match cmd.when.unwrap_or(When::Before) {
                    When::Before => Stage::Before,
                    When::After => Stage::After,
                },
            })
            .collect();
        Ok(Project {
            name: self.name.clone(),
            base,
            path,
            args: self.args.clone().unwrap_or_default(),
            error_pattern: self.error_pattern.clone().unwrap_or_default(),
            build: self.build.unwrap_or(true),
            build_args: self
                .build_args
                .clone()
                .unwrap_or_else(|| vec!["install".to_string()]),
            tools,
            commands,
        })
    }
}
