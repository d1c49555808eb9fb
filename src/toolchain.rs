//! Toolchain description and executable lookup.
//!
//! The supervisor is toolchain-agnostic: the build program, the source file
//! extension and the two environment variables naming the workspace and the
//! binary-output directory all come from configuration. The defaults describe
//! the Go toolchain (`go`, `.go`, `GOPATH`, `GOBIN`).

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// How to build and where to find built binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    /// Build program, e.g. `go`.
    pub program: String,
    /// Source file extension without the dot.
    pub source_ext: String,
    /// Environment variable holding the toolchain workspace (may be a path list).
    pub workspace_var: String,
    /// Environment variable naming the binary-output directory.
    pub bin_var: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            program: "go".to_string(),
            source_ext: "go".to_string(),
            workspace_var: "GOPATH".to_string(),
            bin_var: "GOBIN".to_string(),
        }
    }
}

impl Toolchain {
    /// First entry of the workspace variable.
    pub fn workspace_dir(&self) -> Option<PathBuf> {
        env_path(&self.workspace_var)
    }

    /// Where builds are told to place binaries: `<workspace>/bin`.
    pub fn build_bin_dir(&self) -> Option<PathBuf> {
        self.workspace_dir().map(|dir| dir.join("bin"))
    }

    /// Where the supervisor looks for built binaries.
    ///
    /// This is the directory builds install into: `<workspace>/bin` when the
    /// workspace variable is set, since builds export it as the bin variable.
    /// Only without a workspace does the inherited bin variable apply.
    pub fn bin_dir(&self) -> Option<PathBuf> {
        self.build_bin_dir().or_else(|| env_path(&self.bin_var))
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    let value = std::env::var_os(var)?;
    std::env::split_paths(&value).find(|p| !p.as_os_str().is_empty())
}

/// Executable suffixes to try on the current platform, extension-less first.
pub fn exe_suffixes() -> Vec<&'static str> {
    let mut suffixes = vec![""];
    if !std::env::consts::EXE_SUFFIX.is_empty() {
        suffixes.push(std::env::consts::EXE_SUFFIX);
    }
    suffixes
}

/// Ordered list of places a project's executable may live.
///
/// Local candidates (the literal path, then the base-joined path) come first,
/// each tried with every suffix, followed by the binary-output directory.
pub fn candidate_paths(
    base: &Path,
    path: &Path,
    bin_dir: Option<&Path>,
    suffixes: &[&str],
) -> Vec<PathBuf> {
    let locals = [path.to_path_buf(), base.join(path)];
    let mut candidates = Vec::new();
    for suffix in suffixes {
        for local in &locals {
            push_unique(&mut candidates, with_suffix(local, suffix));
        }
    }
    if let (Some(dir), Some(name)) = (bin_dir, path.file_name()) {
        let installed = dir.join(name);
        for suffix in suffixes {
            push_unique(&mut candidates, with_suffix(&installed, suffix));
        }
    }
    candidates
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

fn push_unique(paths: &mut Vec<PathBuf>, path: PathBuf) {
    if !paths.contains(&path) {
        paths.push(path);
    }
}
