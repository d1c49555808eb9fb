//! devrack: build, run and restart projects while they are being developed.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads `devrack.toml`, wires the log-record printer and hands control to the
//! session or to one of the one-shot subcommands.

mod command;
mod compile;
mod config;
mod errors;
mod events;
mod exec;
mod logging;
mod output;
mod process;
mod runner;
mod session;
mod toolchain;
mod tools;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::compile::{compile_reported, BuildOutcome};
use crate::events::{Event, LogSink, Reporter};
use crate::logging::LogLevel;
use crate::output::{format_json, sanitize_text, Level, LogRecord, RecordStore};
use crate::process::{Project, Stage};
use crate::toolchain::Toolchain;

const DEFAULT_MAX_LINES: usize = 1000;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Build, run and restart projects during development",
    styles = help_styles()
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to devrack.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Only act on the named project (repeatable).
    #[arg(long)]
    project: Vec<String>,
    /// Prepend elapsed time to each line.
    #[arg(long)]
    timestamp: bool,
    /// Print records as JSON lines.
    #[arg(long)]
    json: bool,
    /// Strip ANSI escapes from captured output.
    #[arg(long)]
    no_color: bool,
    /// Records kept in memory per project and level.
    #[arg(long)]
    max_lines: Option<usize>,
    /// Diagnostic log level (overrides DEVRACK_LOG).
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build and run every project; type `r` + Enter to restart (default).
    Run,
    /// Build every project once.
    Build,
    /// Run the configured tools against files or directories.
    Tools {
        /// Targets; defaults to each project's base directory.
        paths: Vec<PathBuf>,
    },
    /// Run the configured project commands.
    Exec {
        /// Run the `after` commands instead of the `before` ones.
        #[arg(long)]
        after: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level)?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE));
    let cfg = config::load_config(&config_path)?;
    let toolchain = cfg.toolchain();
    let root = config_root(&config_path)?;
    let projects = select_projects(cfg.projects(&root, &toolchain)?, &cli.project)?;

    let printer = Printer {
        json: cli.json,
        strip_ansi: cli.no_color,
        timestamp: cli.timestamp || cfg.timestamp.unwrap_or(false),
        start: Instant::now(),
        store: RecordStore::new(cli.max_lines.or(cfg.max_lines).unwrap_or(DEFAULT_MAX_LINES)),
    };
    let (record_tx, record_rx) = mpsc::unbounded_channel();
    let printer = spawn_printer(record_rx, printer);
    let sink: Arc<dyn LogSink> = Arc::new(record_tx);

    let outcome = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_session(projects, toolchain, sink).await,
        Commands::Build => build_all(projects, toolchain, sink).await,
        Commands::Tools { paths } => run_tool_targets(projects, toolchain, sink, paths).await,
        Commands::Exec { after } => exec_commands(projects, sink, after).await,
    };

    let printer = printer.await.context("printer task failed")?;
    printer.print_summary();
    outcome
}

async fn run_session(projects: Vec<Project>, toolchain: Toolchain, sink: Arc<dyn LogSink>) -> Result<()> {
    let (event_tx, event_rx) = mpsc::channel(16);
    let hard = CancellationToken::new();
    spawn_signal_listener(event_tx.clone(), hard.clone());
    spawn_stdin_listener(event_tx);
    session::supervise(projects, toolchain, sink, event_rx, hard).await?;
    Ok(())
}

async fn build_all(projects: Vec<Project>, toolchain: Toolchain, sink: Arc<dyn LogSink>) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let mut failed = 0;
    for project in &projects {
        let reporter = Reporter::new(&project.name, sink.clone());
        match compile_reported(&cancel, project, &toolchain, &reporter).await? {
            BuildOutcome::Success => {}
            BuildOutcome::Failed { .. } => failed += 1,
            BuildOutcome::Killed => return Ok(()),
        }
    }
    if failed > 0 {
        bail!("{} of {} builds failed", failed, projects.len());
    }
    Ok(())
}

async fn run_tool_targets(
    projects: Vec<Project>,
    toolchain: Toolchain,
    sink: Arc<dyn LogSink>,
    paths: Vec<PathBuf>,
) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let cwd = std::env::current_dir().context("failed to resolve current dir")?;
    let mut failures = 0;
    for project in &projects {
        let targets = if paths.is_empty() {
            vec![project.base.clone()]
        } else {
            paths.iter().map(|p| cwd.join(p)).collect()
        };
        let reporter = Reporter::new(&project.name, sink.clone());
        let report = session::run_tools(&cancel, project, &toolchain, &targets, &reporter).await;
        failures += report.failures.len();
    }
    if failures > 0 {
        bail!("{} tool run(s) failed", failures);
    }
    Ok(())
}

async fn exec_commands(projects: Vec<Project>, sink: Arc<dyn LogSink>, after: bool) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let stage = if after { Stage::After } else { Stage::Before };
    let mut all_ok = true;
    for project in &projects {
        let reporter = Reporter::new(&project.name, sink.clone());
        all_ok &= session::run_commands(&cancel, project, stage, &reporter).await;
    }
    if !all_ok {
        bail!("some commands failed");
    }
    Ok(())
}

fn config_root(config_path: &Path) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("failed to resolve current dir")?;
    Ok(match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => cwd.join(parent),
        _ => cwd,
    })
}

fn select_projects(projects: Vec<Project>, names: &[String]) -> Result<Vec<Project>> {
    if names.is_empty() {
        return Ok(projects);
    }
    for name in names {
        if !projects.iter().any(|p| &p.name == name) {
            bail!("unknown project: {}", name);
        }
    }
    Ok(projects
        .into_iter()
        .filter(|p| names.contains(&p.name))
        .collect())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

/// First Ctrl-C (or SIGTERM) asks the session to stop; a second one also
/// abandons the after-commands.
fn spawn_signal_listener(tx: mpsc::Sender<Event>, hard: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(Event::Shutdown).await;
        if tokio::signal::ctrl_c().await.is_ok() {
            hard.cancel();
        }
    });
}

fn spawn_stdin_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let event = match line.trim() {
                "r" | "rs" | "restart" => Event::Restart,
                "q" | "quit" => Event::Shutdown,
                _ => continue,
            };
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    });
}

struct Printer {
    json: bool,
    strip_ansi: bool,
    timestamp: bool,
    start: Instant,
    store: RecordStore,
}

impl Printer {
    fn handle(&mut self, record: LogRecord) {
        let line = self.format_line(&record);
        match record.level {
            Level::Error => eprintln!("{}", line),
            Level::Out | Level::Log => println!("{}", line),
        }
        self.store.push(record);
    }

    fn format_line(&self, record: &LogRecord) -> String {
        if self.json {
            return format_json(record);
        }
        let text = sanitize_text(&record.text, self.strip_ansi);
        let mut prefix = format!("[{} {}]", record.project, record.origin.label());
        if self.timestamp {
            prefix = format!("{} {}", self.elapsed(), prefix);
        }
        match record.level {
            Level::Error => format!("{} error: {}", prefix, text),
            Level::Out | Level::Log => format!("{} {}", prefix, text),
        }
    }

    fn elapsed(&self) -> String {
        let secs = self.start.elapsed().as_secs();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }

    fn print_summary(&self) {
        for (project, errors) in self.store.error_summary() {
            let Some(records) = self.store.project(&project) else {
                continue;
            };
            debug!(
                %project,
                out = records.out.len(),
                log = records.log.len(),
                rotated = records.rotated,
                errors,
                "record totals"
            );
            if errors == 0 || self.json {
                continue;
            }
            let last = records.errors.last().map(|r| r.text.as_str()).unwrap_or("");
            eprintln!("[{}] {} error line(s), last: {}", project, errors, last);
        }
    }
}

/// Single consumer of every record; owns the store so appends never race.
fn spawn_printer(
    mut rx: mpsc::UnboundedReceiver<LogRecord>,
    mut printer: Printer,
) -> JoinHandle<Printer> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            printer.handle(record);
        }
        printer
    })
}

fn help_styles() -> Styles {
    let color = |c: AnsiColor| Style::new().fg_color(Some(c.into()));
    Styles::styled()
        .header(color(AnsiColor::Blue).effects(Effects::BOLD))
        .usage(color(AnsiColor::Blue).effects(Effects::BOLD))
        .literal(color(AnsiColor::Cyan))
        .placeholder(color(AnsiColor::White).effects(Effects::DIMMED))
        .error(color(AnsiColor::Red).effects(Effects::BOLD))
        .invalid(color(AnsiColor::Red))
}
