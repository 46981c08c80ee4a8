//! Heartbeat and editor event types.
//!
//! This module defines the heartbeat schema sent to the tracking endpoint and
//! the editor activity events the coordinator consumes. Heartbeats serialize
//! to the WakaTime wire format: optional fields that are absent are omitted
//! from the JSON body rather than sent as `null`.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Entity value used in place of the file path when file names are hidden.
pub const HIDDEN_ENTITY: &str = "HIDDEN";

/// Kind of entity a heartbeat refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    #[default]
    File,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
        }
    }
}

/// Activity category reported with each heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    Coding,
    Building,
    Indexing,
    Debugging,
    Running,
    Testing,
    Manual,
    Writing,
    Designing,
    Researching,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Coding => "coding",
            Self::Building => "building",
            Self::Indexing => "indexing",
            Self::Debugging => "debugging",
            Self::Running => "running",
            Self::Testing => "testing",
            Self::Manual => "manual",
            Self::Writing => "writing",
            Self::Designing => "designing",
            Self::Researching => "researching",
        };
        f.write_str(name)
    }
}

/// Cursor location inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// 1-based line number.
    #[serde(rename = "lineno")]
    pub line: u32,

    /// 0-based column within the line.
    #[serde(rename = "cursorpos")]
    pub column: u32,
}

impl CursorPosition {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// One timestamped activity record destined for the tracking endpoint.
///
/// Heartbeats are values: once built they are never modified in place.
/// Enrichment and privacy filtering consume a heartbeat and return a new one.
///
/// # Example
///
/// ```
/// use wakatrack::types::{CursorPosition, Heartbeat};
///
/// let heartbeat = Heartbeat::new("/repo/src/main.rs", true)
///     .with_project(Some("repo".to_string()))
///     .with_language(Some("rust".to_string()))
///     .with_cursor(Some(CursorPosition::new(12, 4)))
///     .with_lines(Some(80));
///
/// assert_eq!(heartbeat.entity(), "/repo/src/main.rs");
/// assert!(heartbeat.is_write());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "time")]
    pub(crate) timestamp: f64,

    pub(crate) entity: String,

    #[serde(rename = "type")]
    pub(crate) entity_type: EntityType,

    pub(crate) category: Category,

    pub(crate) is_write: bool,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub(crate) project: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub(crate) language: Option<String>,

    #[serde(flatten)]
    pub(crate) cursor: Option<CursorPosition>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub(crate) lines: Option<u32>,
}

impl Heartbeat {
    /// Creates a file heartbeat stamped with the current wall-clock time.
    #[must_use]
    pub fn new(entity: impl Into<String>, is_write: bool) -> Self {
        Self {
            timestamp: current_timestamp(),
            entity: entity.into(),
            entity_type: EntityType::File,
            category: Category::default(),
            is_write,
            project: None,
            language: None,
            cursor: None,
            lines: None,
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    #[must_use]
    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    #[must_use]
    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    #[must_use]
    pub fn with_cursor(mut self, cursor: Option<CursorPosition>) -> Self {
        self.cursor = cursor;
        self
    }

    #[must_use]
    pub fn with_lines(mut self, lines: Option<u32>) -> Self {
        self.lines = lines;
        self
    }

    /// Seconds since the Unix epoch at which the heartbeat was created.
    #[must_use]
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.is_write
    }

    #[must_use]
    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    #[must_use]
    pub fn cursor(&self) -> Option<CursorPosition> {
        self.cursor
    }

    #[must_use]
    pub fn lines(&self) -> Option<u32> {
        self.lines
    }
}

/// What happened in the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A document was opened or focused.
    Open,
    /// Document content was modified.
    Edit,
    /// Document was written to disk.
    Save,
    /// The cursor or selection moved.
    CursorMove,
}

impl EventKind {
    /// Returns `true` for events that modify the document.
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Edit | Self::Save)
    }
}

/// An activity notification from the editor.
///
/// The editor adapter only emits events for documents backed by a path;
/// scratch buffers never reach the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorEvent {
    pub kind: EventKind,

    pub path: PathBuf,

    /// Language identifier as known to the editor (e.g. `rust`).
    #[serde(default)]
    pub language: Option<String>,

    #[serde(default)]
    pub cursor: Option<CursorPosition>,

    /// Total line count of the document at event time.
    #[serde(default)]
    pub lines: Option<u32>,

    #[serde(default)]
    pub category: Option<Category>,
}

impl EditorEvent {
    /// Creates an event with no cursor, language or line information.
    #[must_use]
    pub fn new(kind: EventKind, path: impl AsRef<Path>) -> Self {
        Self {
            kind,
            path: path.as_ref().to_path_buf(),
            language: None,
            cursor: None,
            lines: None,
            category: None,
        }
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    #[must_use]
    pub fn with_cursor(mut self, line: u32, column: u32) -> Self {
        self.cursor = Some(CursorPosition::new(line, column));
        self
    }

    #[must_use]
    pub fn with_lines(mut self, lines: u32) -> Self {
        self.lines = Some(lines);
        self
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.kind.is_write()
    }

    /// Parses one line of newline-delimited JSON.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Json`](crate::error::TrackerError::Json) if the
    /// line is not a valid event.
    pub fn from_json_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Current Unix time in fractional seconds.
fn current_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
