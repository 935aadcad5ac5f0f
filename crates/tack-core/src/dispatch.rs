//! Timer-driven pull of remote changes into the local cache.
//!
//! While the backend reports connected, each tick fetches the cheap
//! total-notes-and-last-update signal; nothing changed means no work. On a
//! change the full note set is reloaded, diffed against the last snapshot,
//! and typed notifications go out to observers scoped to the affected
//! paths. Changes attributable to this instance's own writes are filtered
//! so the UI is not refreshed for an action the user already sees.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::backend::NoteBackend;
use crate::error::Result;
use crate::events::{NoteEvent, NoteEventKind, NoteEvents};
use crate::models::{Note, NoteId};

/// Backend handle shared between the host and the dispatcher task
pub type SharedBackend = Arc<Mutex<Box<dyn NoteBackend + Send>>>;

#[derive(Default)]
struct PollState {
    high_water: Option<(u64, Option<DateTime<Utc>>)>,
    snapshot: HashMap<NoteId, Note>,
    /// (id -> version) pairs this instance wrote itself; `None` marks a
    /// local delete. Consumed by the next diff, then forgotten.
    recent_local: HashMap<NoteId, Option<i64>>,
}

pub struct SyncDispatcher {
    backend: SharedBackend,
    events: NoteEvents,
    poll_interval: Duration,
    state: Arc<Mutex<PollState>>,
    task: Option<JoinHandle<()>>,
}

impl SyncDispatcher {
    #[must_use]
    pub fn new(backend: SharedBackend, events: NoteEvents, poll_interval: Duration) -> Self {
        Self {
            backend,
            events,
            poll_interval,
            state: Arc::new(Mutex::new(PollState::default())),
            task: None,
        }
    }

    /// Record a write made by this instance so the next poll does not
    /// notify the UI about it.
    pub async fn mark_local_change(&self, id: NoteId, version: i64) {
        self.state
            .lock()
            .await
            .recent_local
            .insert(id, Some(version));
    }

    pub async fn mark_local_delete(&self, id: NoteId) {
        self.state.lock().await.recent_local.insert(id, None);
    }

    /// One reconciliation pass. Returns whether remote changes were applied.
    pub async fn poll_once(&self) -> Result<bool> {
        Self::poll(&self.backend, &self.state, &self.events).await
    }

    async fn poll(
        backend: &SharedBackend,
        state: &Arc<Mutex<PollState>>,
        events: &NoteEvents,
    ) -> Result<bool> {
        let mut backend = backend.lock().await;
        if !backend.is_connected().await {
            return Ok(false);
        }

        let stats = backend.stats().await?;
        let signal = (stats.total_notes, stats.last_updated);
        {
            let state = state.lock().await;
            if state.high_water == Some(signal) {
                return Ok(false);
            }
        }

        backend.load_all().await?;
        let notes = backend.get_all().await?;
        drop(backend);

        let mut state = state.lock().await;
        let fresh: HashMap<NoteId, Note> = notes
            .into_iter()
            .filter_map(|note| note.id.clone().map(|id| (id, note)))
            .collect();

        let mut applied = false;
        for (id, note) in &fresh {
            let (kind, changed) = match state.snapshot.get(id) {
                Some(old) if old == note => (NoteEventKind::NoteUpdated, false),
                Some(old) if reply_only_change(old, note) => (NoteEventKind::ReplyAdded, true),
                Some(_) => (NoteEventKind::NoteUpdated, true),
                None => (NoteEventKind::NoteCreated, true),
            };
            if !changed {
                continue;
            }
            if state.recent_local.remove(id) == Some(Some(note.version)) {
                continue;
            }
            applied = true;
            events.emit(NoteEvent {
                kind,
                note_id: Some(id.to_string()),
                file_path: Some(note.file_path.clone()),
                line_number: Some(note.line_number),
                author: Some(note.author.clone()),
                version: Some(note.version),
                session_id: None,
            });
        }
        let deleted: Vec<(NoteId, Note)> = state
            .snapshot
            .iter()
            .filter(|(id, _)| !fresh.contains_key(*id))
            .map(|(id, note)| (id.clone(), note.clone()))
            .collect();
        for (id, old) in deleted {
            if state.recent_local.remove(&id) == Some(None) {
                continue;
            }
            applied = true;
            events.emit(NoteEvent {
                kind: NoteEventKind::NoteDeleted,
                note_id: Some(id.to_string()),
                file_path: Some(old.file_path.clone()),
                line_number: Some(old.line_number),
                author: Some(old.author.clone()),
                version: Some(old.version),
                session_id: None,
            });
        }

        state.snapshot = fresh;
        state.high_water = Some(signal);

        if applied {
            events.emit(NoteEvent::bare(NoteEventKind::SyncApplied));
            tracing::debug!("remote changes applied to local cache");
        }
        Ok(applied)
    }

    /// Start the periodic loop. Starting an already-started dispatcher is
    /// a no-op.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let backend = self.backend.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let period = self.poll_interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = Self::poll(&backend, &state, &events).await {
                    tracing::warn!(%err, "sync poll failed");
                }
            }
        }));
    }

    /// Stop the periodic loop and release the timer. Idempotent; safe on a
    /// dispatcher that was never started.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// True when the only difference is appended replies. `updated_at` is
/// ignored because backends touch it when a reply lands.
fn reply_only_change(old: &Note, new: &Note) -> bool {
    if old.replies.len() >= new.replies.len() {
        return false;
    }
    let mut a = old.clone();
    let mut b = new.clone();
    a.replies.clear();
    b.replies.clear();
    a.updated_at = None;
    b.updated_at = None;
    a == b
}

impl Drop for SyncDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::backend::RelationalBackend;
    use crate::models::{NoteState, Severity};

    fn shared(backend: RelationalBackend) -> SharedBackend {
        Arc::new(Mutex::new(Box::new(backend) as Box<dyn NoteBackend + Send>))
    }

    async fn opened(path: &std::path::Path, author: &str) -> RelationalBackend {
        let mut backend =
            RelationalBackend::new(path, "demo".to_string(), author.to_string());
        backend.setup().await.unwrap();
        backend
    }

    fn finding(author: &str, path: &str) -> Note {
        Note::new(path, 4, author, "hardcoded secret", NoteState::Vulnerable)
            .with_severity(Severity::Medium)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_change_is_a_no_op() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("notes.db");
        let events = NoteEvents::new();
        let mut receiver = events.subscribe();
        let dispatcher = SyncDispatcher::new(
            shared(opened(&db, "alice").await),
            events,
            Duration::from_secs(5),
        );

        // First poll establishes the high-water mark for the empty store
        dispatcher.poll_once().await.unwrap();
        assert!(!dispatcher.poll_once().await.unwrap());
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_change_emits_scoped_events() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("notes.db");
        let events = NoteEvents::new();
        let mut receiver = events.subscribe();
        let dispatcher = SyncDispatcher::new(
            shared(opened(&db, "alice").await),
            events,
            Duration::from_secs(5),
        );
        dispatcher.poll_once().await.unwrap();

        // Another client process writes to the same database
        let mut writer = opened(&db, "bob").await;
        let mut note = finding("bob", "src/creds.py");
        writer.save(&mut note).await.unwrap();

        assert!(dispatcher.poll_once().await.unwrap());
        let created = receiver.recv().await.unwrap();
        assert_eq!(created.kind, NoteEventKind::NoteCreated);
        assert_eq!(created.file_path.as_deref(), Some("src/creds.py"));
        assert_eq!(created.author.as_deref(), Some("bob"));
        assert_eq!(receiver.recv().await.unwrap().kind, NoteEventKind::SyncApplied);

        // Next poll sees no further change
        assert!(!dispatcher.poll_once().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_own_session_changes_are_filtered() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("notes.db");
        let events = NoteEvents::new();
        let mut receiver = events.subscribe();
        let backend = shared(opened(&db, "alice").await);
        let dispatcher = SyncDispatcher::new(backend.clone(), events, Duration::from_secs(5));
        dispatcher.poll_once().await.unwrap();

        let mut note = finding("alice", "src/own.py");
        backend.lock().await.save(&mut note).await.unwrap();
        dispatcher
            .mark_local_change(note.id.clone().unwrap(), note.version)
            .await;

        assert!(!dispatcher.poll_once().await.unwrap());
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reply_only_change_is_a_reply_event() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("notes.db");
        let mut writer = opened(&db, "bob").await;
        let mut note = finding("bob", "src/creds.py");
        writer.save(&mut note).await.unwrap();
        let id = note.id.clone().unwrap();

        let events = NoteEvents::new();
        let mut receiver = events.subscribe();
        let dispatcher = SyncDispatcher::new(
            shared(opened(&db, "alice").await),
            events,
            Duration::from_secs(5),
        );
        dispatcher.poll_once().await.unwrap();
        while receiver.try_recv().is_ok() {}

        let mut reply = crate::models::Reply::new(id.clone(), "carol", "seen in prod logs");
        writer.add_reply(&id, &mut reply).await.unwrap();

        assert!(dispatcher.poll_once().await.unwrap());
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.kind, NoteEventKind::ReplyAdded);
        assert_eq!(event.file_path.as_deref(), Some("src/creds.py"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_detected_from_snapshot() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("notes.db");
        let mut writer = opened(&db, "bob").await;
        let mut note = finding("bob", "src/gone.py");
        writer.save(&mut note).await.unwrap();

        let events = NoteEvents::new();
        let mut receiver = events.subscribe();
        let dispatcher = SyncDispatcher::new(
            shared(opened(&db, "alice").await),
            events,
            Duration::from_secs(5),
        );
        dispatcher.poll_once().await.unwrap();
        // Drain the initial create + sync events
        while receiver.try_recv().is_ok() {}

        writer.delete(&note.id.clone().unwrap()).await.unwrap();
        assert!(dispatcher.poll_once().await.unwrap());
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.kind, NoteEventKind::NoteDeleted);
        assert_eq!(event.file_path.as_deref(), Some("src/gone.py"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("notes.db");
        let mut dispatcher = SyncDispatcher::new(
            shared(opened(&db, "alice").await),
            NoteEvents::new(),
            Duration::from_millis(10),
        );

        // Never started
        dispatcher.stop();
        dispatcher.stop();

        dispatcher.start();
        dispatcher.start();
        dispatcher.stop();
        dispatcher.stop();
    }
}
