//! Log records and their buffering.
//!
//! Every component of the supervisor reports what it sees as a `LogRecord`:
//! subprocess lines, build results, tool failures and lifecycle notes. This
//! module defines the record itself, a bounded ring buffer for records, and the
//! per-project `RecordStore` that the printer task owns.

use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use serde::Serialize;
use strip_ansi_escapes::strip;

/// Which component produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// The toolchain build command.
    Build,
    /// The supervised executable.
    Run,
    /// An auxiliary toolchain command.
    Tool,
    /// A before/after project command.
    Command,
    /// The supervisor itself (binary lookup, restarts).
    Supervisor,
}

impl Origin {
    pub fn label(self) -> &'static str {
        match self {
            Origin::Build => "build",
            Origin::Run => "run",
            Origin::Tool => "tool",
            Origin::Command => "command",
            Origin::Supervisor => "devrack",
        }
    }
}

/// Generic split of records into plain output, status logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Ordinary program output.
    Out,
    /// Status messages ("Built", "Ended").
    Log,
    /// Error output.
    Error,
}

/// A single timestamped, categorized unit of captured output or status.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    /// When the record was produced.
    pub time: SystemTime,
    /// Name of the project the record belongs to.
    pub project: String,
    /// The content of the record.
    pub text: String,
    /// Component that produced the record.
    pub origin: Origin,
    /// Output/log/error classification.
    pub level: Level,
}

impl LogRecord {
    pub fn new(project: &str, origin: Origin, level: Level, text: impl Into<String>) -> Self {
        Self {
            time: SystemTime::now(),
            project: project.to_string(),
            text: text.into(),
            origin,
            level,
        }
    }
}

/// A fixed-capacity ring buffer for storing `LogRecord`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    records: VecDeque<LogRecord>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            records: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a record to the buffer.
    ///
    /// Returns `true` if an old record was dropped to make room.
    pub fn push(&mut self, record: LogRecord) -> bool {
        let mut dropped = false;
        self.records.push_back(record);
        while self.records.len() > self.max_lines {
            self.records.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogRecord> {
        self.records.iter()
    }

    /// Most recent record, if any.
    pub fn last(&self) -> Option<&LogRecord> {
        self.records.back()
    }
}

/// Per-project buffers split by level, plus running totals.
///
/// Owned by a single consumer task; producers only ever hand records over a
/// channel, so appends are serialized without a lock.
#[derive(Debug)]
pub struct RecordStore {
    max_lines: usize,
    projects: HashMap<String, ProjectRecords>,
}

#[derive(Debug)]
pub struct ProjectRecords {
    pub out: LogBuffer,
    pub log: LogBuffer,
    pub errors: LogBuffer,
    /// Total errors seen, including ones rotated out of `errors`.
    pub error_count: usize,
    /// Records of any level pushed out of a full buffer.
    pub rotated: usize,
}

impl RecordStore {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            projects: HashMap::new(),
        }
    }

    pub fn push(&mut self, record: LogRecord) {
        let max_lines = self.max_lines;
        let entry = self
            .projects
            .entry(record.project.clone())
            .or_insert_with(|| ProjectRecords {
                out: LogBuffer::new(max_lines),
                log: LogBuffer::new(max_lines),
                errors: LogBuffer::new(max_lines),
                error_count: 0,
                rotated: 0,
            });
        let dropped = match record.level {
            Level::Out => entry.out.push(record),
            Level::Log => entry.log.push(record),
            Level::Error => {
                entry.error_count += 1;
                entry.errors.push(record)
            }
        };
        if dropped {
            entry.rotated += 1;
        }
    }

    pub fn project(&self, name: &str) -> Option<&ProjectRecords> {
        self.projects.get(name)
    }

    /// Error totals per project, sorted by project name.
    pub fn error_summary(&self) -> Vec<(String, usize)> {
        let mut summary: Vec<(String, usize)> = self
            .projects
            .iter()
            .map(|(name, records)| (name.clone(), records.error_count))
            .collect();
        summary.sort();
        summary
    }
}

/// Prepares captured text for a terminal line: drops a trailing carriage
/// return left by CRLF output and, with `strip_ansi`, every escape sequence.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    let text = text.strip_suffix('\r').unwrap_or(text);
    if strip_ansi {
        String::from_utf8_lossy(&strip(text.as_bytes())).into_owned()
    } else {
        text.to_owned()
    }
}

/// Renders a record as a single JSON line. Falls back to the bare text if
/// serialization fails.
pub fn format_json(record: &LogRecord) -> String {
    serde_json::to_string(record).unwrap_or_else(|_| record.text.clone())
}
