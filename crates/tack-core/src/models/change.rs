//! Change and queue envelopes used by sync and offline replay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::note::{Note, NoteId};

/// Kind of mutation a change describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

/// Envelope describing one mutation, exchanged during synchronization and
/// conflict detection. Never persisted beyond the sync window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub action: ChangeAction,
    /// The resulting note; absent for deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<Note>,
    pub note_id: NoteId,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    /// Opaque identifier of the originating client instance
    pub session_id: String,
}

impl ChangeRecord {
    /// Timestamp used for conflict ordering: the carried note's effective
    /// timestamp when present, otherwise the record's own.
    #[must_use]
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.note
            .as_ref()
            .map_or(self.timestamp, Note::effective_timestamp)
    }
}

/// One buffered mutation awaiting reconnection. FIFO; replayed in enqueue
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub action: ChangeAction,
    /// Full note for create/update; deletes carry only the id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<Note>,
    pub note_id: NoteId,
    pub queued_at: DateTime<Utc>,
    /// Replay attempts so far; bounded by the controller
    #[serde(default)]
    pub attempts: u32,
}

impl QueuedOperation {
    #[must_use]
    pub fn save(note: Note) -> Self {
        let action = if note.updated_at.is_some() || note.version > 1 {
            ChangeAction::Update
        } else {
            ChangeAction::Create
        };
        let note_id = note.id.clone().unwrap_or_else(NoteId::generate);
        Self {
            action,
            note: Some(note),
            note_id,
            queued_at: Utc::now(),
            attempts: 0,
        }
    }

    #[must_use]
    pub fn delete(note_id: NoteId) -> Self {
        Self {
            action: ChangeAction::Delete,
            note: None,
            note_id,
            queued_at: Utc::now(),
            attempts: 0,
        }
    }
}
