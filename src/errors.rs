//! Error types for the supervision core.
//!
//! Build, tool and command failures are not errors here; they come back as
//! data. These variants cover what stops an operation from making progress.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("can't run a not compiled project: no binary found for {0}")]
    NotBuilt(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stop {program}: {source}")]
    Kill {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("empty command in {0}")]
    EmptyCommand(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Whether the host should give up entirely rather than wait for the
    /// next restart request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SupervisorError::NotBuilt(_) | SupervisorError::Kill { .. })
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
