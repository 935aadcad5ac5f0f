//! tack-core - Synchronization engine for Tack
//!
//! This crate contains the note model, the storage backends, and the sync
//! machinery (offline queue, conflict resolution, migration, dispatcher)
//! shared by every Tack frontend.

pub mod backend;
pub mod config;
pub mod conflict;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod migrate;
pub mod models;
pub mod queue;

pub use backend::{create_backend, NoteBackend};
pub use config::{BackendKind, EngineConfig};
pub use dispatch::{SharedBackend, SyncDispatcher};
pub use error::{Error, Result};
pub use events::{NoteEvent, NoteEventKind, NoteEvents};
pub use models::{Note, NoteId, NoteState, NoteStats, Reply, Severity};
pub use queue::OfflineController;
