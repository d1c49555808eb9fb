//! Event and log-sink definitions.
//!
//! `LogSink` is the seam every component reports through; the session wires it
//! to a channel drained by a single printer task. `Event` drives the session
//! loop (restart requests and shutdown).

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::output::{Level, LogRecord, Origin};

/// Destination for log records.
///
/// Implementations must be cheap to call from many tasks at once; the channel
/// implementation hands records to one consumer which serializes them.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: LogRecord);
}

impl LogSink for mpsc::UnboundedSender<LogRecord> {
    fn emit(&self, record: LogRecord) {
        // The printer going away only happens during shutdown.
        let _ = self.send(record);
    }
}

/// A project-scoped handle on a `LogSink`.
#[derive(Clone)]
pub struct Reporter {
    project: Arc<str>,
    sink: Arc<dyn LogSink>,
}

impl Reporter {
    pub fn new(project: &str, sink: Arc<dyn LogSink>) -> Self {
        Self {
            project: Arc::from(project),
            sink,
        }
    }

    pub fn emit(&self, origin: Origin, level: Level, text: impl Into<String>) {
        self.sink
            .emit(LogRecord::new(&self.project, origin, level, text));
    }

    pub fn out(&self, origin: Origin, text: impl Into<String>) {
        self.emit(origin, Level::Out, text);
    }

    pub fn log(&self, origin: Origin, text: impl Into<String>) {
        self.emit(origin, Level::Log, text);
    }

    pub fn error(&self, origin: Origin, text: impl Into<String>) {
        self.emit(origin, Level::Error, text);
    }
}

/// Represents an event in the session's control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Stop the current run, rebuild and start again.
    Restart,
    /// Stop everything and leave the loop.
    Shutdown,
}
