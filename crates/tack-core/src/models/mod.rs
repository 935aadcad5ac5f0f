//! Data models for tack

mod change;
mod note;

pub use change::{ChangeAction, ChangeRecord, QueuedOperation};
pub use note::{
    ImportMetadata, Note, NoteId, NoteSource, NoteState, NoteStats, Reply, Severity,
};
