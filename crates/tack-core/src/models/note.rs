//! Note and reply models

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// An opaque note identifier.
///
/// The authoritative store assigns ids on first persist; locally generated
/// ids use UUID v7 (time-sortable) so two independent clients never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    /// Generate a fresh unique id using UUID v7
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NoteId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for NoteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NoteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Triage state of a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteState {
    Vulnerable,
    NotVulnerable,
    Todo,
}

impl fmt::Display for NoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Vulnerable => "vulnerable",
            Self::NotVulnerable => "not_vulnerable",
            Self::Todo => "todo",
        };
        write!(f, "{s}")
    }
}

/// Severity of a vulnerable finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
    Low,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        };
        write!(f, "{s}")
    }
}

/// Where a note came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteSource {
    #[default]
    Native,
    Imported,
}

/// Provenance of an imported note (static-analysis tool, report file, rule)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMetadata {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

/// A threaded reply on a note. Append-only, ordered by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NoteId>,
    pub parent_id: NoteId,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub comment: String,
}

impl Reply {
    #[must_use]
    pub fn new(parent_id: NoteId, author: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            id: None,
            parent_id,
            author: author.into(),
            timestamp: Utc::now(),
            comment: comment.into(),
        }
    }
}

/// A persisted security annotation attached to a file/line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Assigned by the authoritative store on first persist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NoteId>,
    /// Always relative to the project root
    pub file_path: String,
    /// 1-based line number
    pub line_number: u32,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Incremented by the authoritative store on every successful update
    #[serde(default = "default_version")]
    pub version: i64,
    pub comment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwe: Option<String>,
    pub state: NoteState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub source: NoteSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_metadata: Option<ImportMetadata>,
    #[serde(default)]
    pub replies: Vec<Reply>,
}

const fn default_version() -> i64 {
    1
}

impl Note {
    /// Create a new unsaved note. The id stays empty until a backend persists it.
    #[must_use]
    pub fn new(
        file_path: impl Into<String>,
        line_number: u32,
        author: impl Into<String>,
        comment: impl Into<String>,
        state: NoteState,
    ) -> Self {
        Self {
            id: None,
            file_path: file_path.into(),
            line_number,
            author: author.into(),
            timestamp: Utc::now(),
            updated_at: None,
            version: 1,
            comment: comment.into(),
            description: None,
            cwe: None,
            state,
            severity: None,
            source: NoteSource::Native,
            import_metadata: None,
            replies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// The timestamp used for conflict comparison: `updated_at` when set,
    /// otherwise the creation timestamp.
    #[must_use]
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.timestamp)
    }

    /// Validate the note at a backend boundary.
    ///
    /// Rejects absolute file paths, empty comments, 0 line numbers, and a
    /// severity that disagrees with the triage state (present iff vulnerable).
    pub fn validate(&self) -> Result<()> {
        if self.comment.trim().is_empty() {
            return Err(Error::Validation("note comment must not be empty".into()));
        }
        if self.line_number == 0 {
            return Err(Error::Validation("line_number is 1-based".into()));
        }
        if is_absolute_path(&self.file_path) {
            return Err(Error::Validation(format!(
                "file_path must be relative to the project root, got absolute path: {}",
                self.file_path
            )));
        }
        match (self.state, self.severity) {
            (NoteState::Vulnerable, None) => Err(Error::Validation(
                "severity is required when state is vulnerable".into(),
            )),
            (NoteState::NotVulnerable | NoteState::Todo, Some(severity)) => {
                Err(Error::Validation(format!(
                    "severity '{severity}' is only valid when state is vulnerable"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Absolute-path check covering both Unix and Windows forms, independent of
/// the host platform (paths travel between machines).
fn is_absolute_path(path: &str) -> bool {
    if Path::new(path).is_absolute() || path.starts_with('/') || path.starts_with('\\') {
        return true;
    }
    // Windows drive prefix, e.g. "C:\..." or "C:/..."
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

/// Aggregate statistics over a project's notes.
///
/// `last_updated` doubles as the sync dispatcher's high-water signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteStats {
    pub total_notes: u64,
    pub vulnerable: u64,
    pub not_vulnerable: u64,
    pub todo: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl NoteStats {
    /// Compute stats over a note set
    #[must_use]
    pub fn from_notes(notes: &[Note]) -> Self {
        let mut stats = Self {
            total_notes: notes.len() as u64,
            ..Self::default()
        };
        for note in notes {
            match note.state {
                NoteState::Vulnerable => stats.vulnerable += 1,
                NoteState::NotVulnerable => stats.not_vulnerable += 1,
                NoteState::Todo => stats.todo += 1,
            }
            let ts = note.effective_timestamp();
            if stats.last_updated.is_none_or(|seen| ts > seen) {
                stats.last_updated = Some(ts);
            }
        }
        stats
    }
}
