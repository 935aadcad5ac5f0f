//! Storage backend contract and implementations.
//!
//! One explicit trait, a closed set of implementations, selected by
//! [`BackendKind`] with exhaustive handling at the call site. Every read
//! returns deep copies; callers may mutate returned values freely without
//! affecting backend state.

mod local;
mod relational;
mod remote;

use async_trait::async_trait;

use crate::config::{BackendKind, EngineConfig};
use crate::error::{Error, Result};
use crate::models::{Note, NoteId, NoteStats, Reply};

pub use local::LocalBackend;
pub use relational::RelationalBackend;
pub use remote::RemoteBackend;

/// Uniform storage contract implemented by every backend.
///
/// `save` is insert-or-update keyed on id; when the id is absent the backend
/// assigns one and writes it back through the `&mut Note`. Mutations by a
/// caller whose identity differs from the note's author fail with
/// [`Error::Ownership`] and leave the stored value untouched.
#[async_trait]
pub trait NoteBackend: Send {
    /// Which backend this is, for exhaustive dispatch and diagnostics
    fn kind(&self) -> BackendKind;

    /// Initialize the backend (open files, run migrations, probe the
    /// gateway). Must be called before any other operation.
    async fn setup(&mut self) -> Result<()>;

    /// Refresh the in-memory cache wholesale from durable storage
    async fn load_all(&mut self) -> Result<()>;

    /// Persist the in-memory cache to durable storage
    async fn save_all(&mut self) -> Result<()>;

    /// All notes in the project, newest first
    async fn get_all(&mut self) -> Result<Vec<Note>>;

    async fn get(&mut self, id: &NoteId) -> Result<Option<Note>>;

    /// Insert or update. Assigns an id when absent, bumps `version` and
    /// `updated_at` on update, both observable through the `&mut Note`.
    async fn save(&mut self, note: &mut Note) -> Result<()>;

    async fn delete(&mut self, id: &NoteId) -> Result<()>;

    /// Append a reply to an existing note. Any identity may reply.
    async fn add_reply(&mut self, note_id: &NoteId, reply: &mut Reply) -> Result<()>;

    async fn get_for_file(&mut self, path: &str) -> Result<Vec<Note>>;

    async fn get_for_line(&mut self, path: &str, line: u32) -> Result<Vec<Note>>;

    /// Remove every note in the project
    async fn clear(&mut self) -> Result<()>;

    /// Flush pending writes to durable storage now
    async fn force_flush(&mut self) -> Result<()>;

    async fn stats(&mut self) -> Result<NoteStats>;

    /// Atomically replace the whole note set. Idempotent.
    async fn replace_all(&mut self, notes: Vec<Note>) -> Result<()>;

    /// Cheap connectivity probe; local backends always report true
    async fn is_connected(&mut self) -> bool;
}

/// Build the backend selected by configuration.
///
/// Collaborative backends must have passed [`EngineConfig::validate`]
/// before reaching this point; missing parameters surface as
/// [`Error::Validation`] here as a second line of defense.
pub fn create_backend(config: &EngineConfig) -> Result<Box<dyn NoteBackend + Send>> {
    match config.backend {
        BackendKind::Local => Ok(Box::new(LocalBackend::new(config))),
        BackendKind::Relational => {
            let db_path = config.db_path.clone().ok_or_else(|| {
                Error::Validation("relational backend requires a database path".into())
            })?;
            Ok(Box::new(RelationalBackend::new(
                db_path,
                config.project.clone(),
                config.author.clone(),
            )))
        }
        BackendKind::RemoteProxy => {
            let api_url = config.normalized_api_url().ok_or_else(|| {
                Error::Validation("remote-proxy backend requires an endpoint URL".into())
            })?;
            Ok(Box::new(RemoteBackend::new(
                api_url,
                config.project.clone(),
                config.author.clone(),
            )?))
        }
    }
}

/// Ownership precondition shared by every backend: only the author of an
/// existing note may mutate or delete it.
pub(crate) fn check_ownership(existing: &Note, caller: &str) -> Result<()> {
    if existing.author == caller {
        return Ok(());
    }
    Err(Error::Ownership {
        id: existing
            .id
            .as_ref()
            .map_or_else(String::new, ToString::to_string),
        owner: existing.author.clone(),
        caller: caller.to_string(),
    })
}
