//! Ad-hoc project commands.
//!
//! Command strings are not parsed by a shell: `'` and `"` are dropped and the
//! remainder is split on whitespace, so quoted arguments containing spaces are
//! split as well.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::errors::{Result, SupervisorError};
use crate::exec::{self, Outcome};
use crate::process;

/// Output of a finished command. `stderr` is only filled on failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stderr: String,
    pub stdout: String,
}

impl CommandOutput {
    pub fn failed(&self) -> bool {
        !self.stderr.is_empty()
    }
}

/// Splits a command string into program and arguments.
pub fn split_command(cmd: &str) -> Vec<String> {
    cmd.replace(['\'', '"'], "")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Resolves the working directory for a command.
///
/// An override already under `base` is used as is; anything else is joined
/// onto `base`.
pub fn resolve_dir(base: &Path, path: Option<&Path>) -> PathBuf {
    match path {
        Some(path) if path.starts_with(base) => path.to_path_buf(),
        Some(path) => base.join(path),
        None => base.to_path_buf(),
    }
}

/// Runs one command in its resolved directory.
pub async fn run_command(
    cancel: &CancellationToken,
    base: &Path,
    command: &process::Command,
) -> Result<Outcome<CommandOutput>> {
    let dir = resolve_dir(base, command.path.as_deref());
    let mut parts = split_command(&command.cmd).into_iter();
    let Some(program) = parts.next() else {
        return Err(SupervisorError::EmptyCommand(dir));
    };

    let mut child = tokio::process::Command::new(program);
    child.args(parts).current_dir(&dir);

    let outcome = match exec::capture(child, cancel).await? {
        Outcome::Killed => Outcome::Killed,
        Outcome::Completed(captured) => {
            let stderr = if captured.success() {
                String::new()
            } else {
                captured.stderr
            };
            Outcome::Completed(CommandOutput {
                stderr,
                stdout: captured.stdout,
            })
        }
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Stage;

    fn command(cmd: &str, path: Option<&str>) -> process::Command {
        process::Command {
            cmd: cmd.to_string(),
            path: path.map(PathBuf::from),
            stage: Stage::Before,
        }
    }

    #[test]
    fn quotes_are_stripped_before_splitting() {
        assert_eq!(split_command("echo 'hi there'"), vec!["echo", "hi", "there"]);
        assert_eq!(split_command("  say \"a  b\" "), vec!["say", "a", "b"]);
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn override_dir_resolution() {
        let base = Path::new("/p");
        assert_eq!(resolve_dir(base, None), PathBuf::from("/p"));
        assert_eq!(resolve_dir(base, Some(Path::new("/p/web"))), PathBuf::from("/p/web"));
        assert_eq!(resolve_dir(base, Some(Path::new("web"))), PathBuf::from("/p/web"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_base_without_override() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let cancel = CancellationToken::new();

        let outcome = run_command(&cancel, &base, &command("pwd", None))
            .await
            .unwrap();
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion");
        };
        assert!(!output.failed());
        assert_eq!(PathBuf::from(output.stdout.trim()), base);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn quoted_words_arrive_as_separate_args() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        let outcome = run_command(&cancel, dir.path(), &command("echo 'hi there'", None))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Completed(CommandOutput {
                stderr: String::new(),
                stdout: "hi there\n".to_string(),
            })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_returns_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        let outcome = run_command(&cancel, dir.path(), &command("ls does-not-exist", None))
            .await
            .unwrap();
        let Outcome::Completed(output) = outcome else {
            panic!("expected completion");
        };
        assert!(output.failed());
        assert!(output.stderr.contains("does-not-exist"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_command_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = run_command(&cancel, dir.path(), &command("sleep 30", None))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Killed);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let cancel = CancellationToken::new();
        let err = run_command(&cancel, Path::new("/p"), &command("''", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::EmptyCommand(_)));
    }
}
