//! Offline queue and reconnection control.
//!
//! Wraps a network-dependent backend. While the wrapped backend is
//! reachable, operations pass straight through and reads are mirrored into
//! a local cache. On the first connectivity failure the controller drops
//! to offline mode: mutations land in the cache and a FIFO queue, reads
//! serve the cache, and a periodic trigger retries the connection with
//! exponential backoff. A successful reconnection replays the queue in
//! order.
//!
//! A replay failure does not silently discard the operation (the behavior
//! the original system had): it is re-queued with a bounded attempt
//! counter and only dropped, with a warning, after [`MAX_REPLAY_ATTEMPTS`].

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::backend::{check_ownership, NoteBackend};
use crate::config::{BackendKind, EngineConfig};
use crate::error::{Error, Result};
use crate::events::{NoteEvent, NoteEventKind, NoteEvents};
use crate::models::{ChangeAction, Note, NoteId, NoteStats, QueuedOperation, Reply};

/// Replay attempts before a queued operation is dropped
pub const MAX_REPLAY_ATTEMPTS: u32 = 3;

/// Connection state of a wrapped backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Online,
    Offline,
    Reconnecting,
}

/// Aggregate outcome of one queue replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
    pub messages: Vec<String>,
}

pub struct OfflineController {
    inner: Box<dyn NoteBackend + Send>,
    author: String,
    state: ConnectionState,
    cache: HashMap<NoteId, Note>,
    queue: VecDeque<QueuedOperation>,
    retry_base: Duration,
    retry_max: Duration,
    retry_delay: Duration,
    last_attempt: Option<Instant>,
    events: NoteEvents,
}

impl OfflineController {
    #[must_use]
    pub fn new(
        inner: Box<dyn NoteBackend + Send>,
        config: &EngineConfig,
        events: NoteEvents,
    ) -> Self {
        Self {
            inner,
            author: config.author.clone(),
            state: ConnectionState::Online,
            cache: HashMap::new(),
            queue: VecDeque::new(),
            retry_base: config.retry_base,
            retry_max: config.retry_max,
            retry_delay: config.retry_base,
            last_attempt: None,
            events,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Current backoff delay, for display in a statusline
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// One user-visible notification per transition, then quiet.
    fn go_offline(&mut self, cause: &Error) {
        if self.state == ConnectionState::Offline {
            return;
        }
        tracing::warn!(%cause, "backend unreachable, entering offline mode");
        self.state = ConnectionState::Offline;
        self.events.emit(NoteEvent::bare(NoteEventKind::WentOffline));
    }

    fn cache_apply(&mut self, op: &QueuedOperation) {
        match op.action {
            ChangeAction::Create | ChangeAction::Update => {
                if let Some(note) = &op.note {
                    self.cache.insert(op.note_id.clone(), note.clone());
                }
            }
            ChangeAction::Delete => {
                self.cache.remove(&op.note_id);
            }
        }
    }

    fn enqueue(&mut self, op: QueuedOperation) {
        self.cache_apply(&op);
        tracing::debug!(action = ?op.action, id = %op.note_id, "queued operation for replay");
        self.queue.push_back(op);
    }

    async fn refresh_cache(&mut self) -> Result<()> {
        let notes = self.inner.get_all().await?;
        self.cache = notes
            .into_iter()
            .filter_map(|note| note.id.clone().map(|id| (id, note)))
            .collect();
        Ok(())
    }

    /// Periodic reconnection trigger. Attempts only when the backoff gate
    /// has elapsed; each failed attempt doubles the delay up to the
    /// ceiling. Returns the replay report on a successful reconnection.
    pub async fn maybe_reconnect(&mut self) -> Result<Option<ReplayReport>> {
        if self.state == ConnectionState::Online {
            return Ok(None);
        }
        let gate = self.retry_delay.min(self.retry_max);
        if let Some(last) = self.last_attempt {
            if last.elapsed() < gate {
                return Ok(None);
            }
        }
        self.attempt_reconnect().await
    }

    /// Immediate reconnection attempt, bypassing the backoff gate and
    /// resetting backoff state.
    pub async fn force_reconnect(&mut self) -> Result<Option<ReplayReport>> {
        if self.state == ConnectionState::Online {
            return Ok(None);
        }
        self.retry_delay = self.retry_base;
        self.attempt_reconnect().await
    }

    async fn attempt_reconnect(&mut self) -> Result<Option<ReplayReport>> {
        self.state = ConnectionState::Reconnecting;
        self.last_attempt = Some(Instant::now());

        if !self.inner.is_connected().await {
            self.retry_delay = (self.retry_delay * 2).min(self.retry_max);
            self.state = ConnectionState::Offline;
            tracing::debug!(
                next_delay_secs = self.retry_delay.as_secs(),
                "reconnection attempt failed"
            );
            return Ok(None);
        }

        let report = self.replay().await;
        if self.state == ConnectionState::Reconnecting {
            self.state = ConnectionState::Online;
            self.retry_delay = self.retry_base;
            self.refresh_cache().await.ok();
            tracing::info!(
                replayed = report.replayed,
                failed = report.failed,
                "back online, queue replayed"
            );
            self.events.emit(NoteEvent::bare(NoteEventKind::BackOnline));
        }
        Ok(Some(report))
    }

    /// Replay the queue FIFO against the real backend. A connectivity
    /// failure mid-replay keeps the remaining operations queued and drops
    /// back to offline; other failures re-queue the single operation for
    /// the next reconnection, up to the attempt limit.
    ///
    /// An authoritative backend may assign a fresh id when a create lands.
    /// Later queued operations still reference the provisional id, so every
    /// adopted id is recorded and rewritten into the operations that follow.
    /// Without the rewrite an offline create-then-edit replays as two
    /// creates, and an offline create-then-delete leaves the note alive.
    async fn replay(&mut self) -> ReplayReport {
        let mut report = ReplayReport::default();
        let pending: Vec<QueuedOperation> = self.queue.drain(..).collect();
        let total = pending.len();
        let mut adopted: HashMap<NoteId, NoteId> = HashMap::new();
        let mut iter = pending.into_iter();

        while let Some(mut op) = iter.next() {
            rewrite_id(&mut op, &adopted);
            let outcome = match op.action {
                ChangeAction::Create | ChangeAction::Update => match op.note.clone() {
                    Some(mut note) => {
                        let result = self.inner.save(&mut note).await;
                        if result.is_ok() {
                            if let Some(assigned) = note.id.clone() {
                                if assigned != op.note_id {
                                    self.adopt_id(&op.note_id, &assigned);
                                    adopted.insert(op.note_id.clone(), assigned);
                                }
                            }
                        }
                        result
                    }
                    None => Err(Error::Validation("queued save without a note".into())),
                },
                ChangeAction::Delete => match self.inner.delete(&op.note_id).await {
                    // Already gone on the authoritative side
                    Err(Error::NotFound(_)) => Ok(()),
                    other => other,
                },
            };

            match outcome {
                Ok(()) => report.replayed += 1,
                Err(err) if err.is_connectivity() => {
                    // Connection died again; keep this and the rest queued,
                    // with adopted ids baked in so the next replay follows them
                    self.queue.push_back(op);
                    self.queue.extend(iter.map(|mut rest| {
                        rewrite_id(&mut rest, &adopted);
                        rest
                    }));
                    self.go_offline(&err);
                    report
                        .messages
                        .push(format!("replay interrupted with {} pending", total));
                    return report;
                }
                Err(err) => {
                    report.failed += 1;
                    op.attempts += 1;
                    if op.attempts < MAX_REPLAY_ATTEMPTS {
                        report
                            .messages
                            .push(format!("{} on {} (will retry)", err, op.note_id));
                        self.queue.push_back(op);
                    } else {
                        tracing::warn!(
                            id = %op.note_id,
                            attempts = op.attempts,
                            %err,
                            "dropping queued operation after repeated replay failures"
                        );
                        report
                            .messages
                            .push(format!("{} on {} (dropped)", err, op.note_id));
                    }
                }
            }
        }
        report
    }

    /// Re-key the cache entry after the authoritative backend replaced a
    /// provisional id during replay.
    fn adopt_id(&mut self, old: &NoteId, new: &NoteId) {
        if let Some(mut note) = self.cache.remove(old) {
            note.id = Some(new.clone());
            self.cache.insert(new.clone(), note);
        }
    }

    /// Offline-mode save: ownership and validation still apply, then the
    /// mutation hits the cache and the queue.
    fn save_offline(&mut self, note: &mut Note) -> Result<()> {
        note.validate()?;
        if let Some(existing) = note.id.as_ref().and_then(|id| self.cache.get(id)) {
            check_ownership(existing, &self.author)?;
        }
        if note.id.is_none() {
            // Provisional; the authoritative store may re-assign on replay
            note.id = Some(NoteId::generate());
        }
        self.enqueue(QueuedOperation::save(note.clone()));
        Ok(())
    }

    fn delete_offline(&mut self, id: &NoteId) -> Result<()> {
        let existing = self
            .cache
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        check_ownership(existing, &self.author)?;
        self.enqueue(QueuedOperation::delete(id.clone()));
        Ok(())
    }

    fn sorted_cache(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = self.cache.values().cloned().collect();
        notes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        notes
    }
}

fn rewrite_id(op: &mut QueuedOperation, adopted: &HashMap<NoteId, NoteId>) {
    if let Some(new_id) = adopted.get(&op.note_id) {
        op.note_id = new_id.clone();
        if let Some(note) = op.note.as_mut() {
            note.id = Some(new_id.clone());
        }
    }
}

#[async_trait]
impl NoteBackend for OfflineController {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn setup(&mut self) -> Result<()> {
        match self.inner.setup().await {
            Ok(()) => {
                self.state = ConnectionState::Online;
                self.refresh_cache().await
            }
            Err(err) if err.is_connectivity() => {
                // Start degraded rather than failing the host
                self.go_offline(&err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn load_all(&mut self) -> Result<()> {
        if self.state != ConnectionState::Online {
            return Ok(());
        }
        match self.inner.load_all().await {
            Ok(()) => self.refresh_cache().await,
            Err(err) if err.is_connectivity() => {
                self.go_offline(&err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn save_all(&mut self) -> Result<()> {
        if self.state != ConnectionState::Online {
            return Ok(());
        }
        self.inner.save_all().await
    }

    async fn get_all(&mut self) -> Result<Vec<Note>> {
        if self.state == ConnectionState::Online {
            match self.inner.get_all().await {
                Ok(notes) => {
                    self.cache = notes
                        .iter()
                        .filter_map(|note| note.id.clone().map(|id| (id, note.clone())))
                        .collect();
                    return Ok(notes);
                }
                Err(err) if err.is_connectivity() => self.go_offline(&err),
                Err(err) => return Err(err),
            }
        }
        Ok(self.sorted_cache())
    }

    async fn get(&mut self, id: &NoteId) -> Result<Option<Note>> {
        if self.state == ConnectionState::Online {
            match self.inner.get(id).await {
                Ok(note) => return Ok(note),
                Err(err) if err.is_connectivity() => self.go_offline(&err),
                Err(err) => return Err(err),
            }
        }
        Ok(self.cache.get(id).cloned())
    }

    async fn save(&mut self, note: &mut Note) -> Result<()> {
        if self.state == ConnectionState::Online {
            match self.inner.save(note).await {
                Ok(()) => {
                    if let Some(id) = &note.id {
                        self.cache.insert(id.clone(), note.clone());
                    }
                    return Ok(());
                }
                Err(err) if err.is_connectivity() => self.go_offline(&err),
                Err(err) => return Err(err),
            }
        }
        self.save_offline(note)
    }

    async fn delete(&mut self, id: &NoteId) -> Result<()> {
        if self.state == ConnectionState::Online {
            match self.inner.delete(id).await {
                Ok(()) => {
                    self.cache.remove(id);
                    return Ok(());
                }
                Err(err) if err.is_connectivity() => self.go_offline(&err),
                Err(err) => return Err(err),
            }
        }
        self.delete_offline(id)
    }

    async fn add_reply(&mut self, note_id: &NoteId, reply: &mut Reply) -> Result<()> {
        if self.state == ConnectionState::Online {
            match self.inner.add_reply(note_id, reply).await {
                Ok(()) => {
                    if let Some(note) = self.cache.get_mut(note_id) {
                        note.replies.push(reply.clone());
                    }
                    return Ok(());
                }
                Err(err) if err.is_connectivity() => self.go_offline(&err),
                Err(err) => return Err(err),
            }
        }
        // Replies ride along on the cached note and replay as an update
        let note = self
            .cache
            .get_mut(note_id)
            .ok_or_else(|| Error::NotFound(note_id.to_string()))?;
        if reply.id.is_none() {
            reply.id = Some(NoteId::generate());
        }
        note.replies.push(reply.clone());
        let snapshot = note.clone();
        self.enqueue(QueuedOperation::save(snapshot));
        Ok(())
    }

    async fn get_for_file(&mut self, path: &str) -> Result<Vec<Note>> {
        if self.state == ConnectionState::Online {
            match self.inner.get_for_file(path).await {
                Ok(notes) => return Ok(notes),
                Err(err) if err.is_connectivity() => self.go_offline(&err),
                Err(err) => return Err(err),
            }
        }
        let mut notes: Vec<Note> = self
            .cache
            .values()
            .filter(|note| note.file_path == path)
            .cloned()
            .collect();
        notes.sort_by_key(|note| note.line_number);
        Ok(notes)
    }

    async fn get_for_line(&mut self, path: &str, line: u32) -> Result<Vec<Note>> {
        if self.state == ConnectionState::Online {
            match self.inner.get_for_line(path, line).await {
                Ok(notes) => return Ok(notes),
                Err(err) if err.is_connectivity() => self.go_offline(&err),
                Err(err) => return Err(err),
            }
        }
        let mut notes: Vec<Note> = self
            .cache
            .values()
            .filter(|note| note.file_path == path && note.line_number == line)
            .cloned()
            .collect();
        notes.sort_by_key(|note| note.timestamp);
        Ok(notes)
    }

    async fn clear(&mut self) -> Result<()> {
        if self.state == ConnectionState::Online {
            match self.inner.clear().await {
                Ok(()) => {
                    self.cache.clear();
                    return Ok(());
                }
                Err(err) if err.is_connectivity() => self.go_offline(&err),
                Err(err) => return Err(err),
            }
        }
        // Queue a delete per cached note so replay reproduces the clear
        let ids: Vec<NoteId> = self.cache.keys().cloned().collect();
        for id in ids {
            self.enqueue(QueuedOperation::delete(id));
        }
        Ok(())
    }

    async fn force_flush(&mut self) -> Result<()> {
        if self.state != ConnectionState::Online {
            return Ok(());
        }
        self.inner.force_flush().await
    }

    async fn stats(&mut self) -> Result<NoteStats> {
        if self.state == ConnectionState::Online {
            match self.inner.stats().await {
                Ok(stats) => return Ok(stats),
                Err(err) if err.is_connectivity() => self.go_offline(&err),
                Err(err) => return Err(err),
            }
        }
        Ok(NoteStats::from_notes(&self.sorted_cache()))
    }

    async fn replace_all(&mut self, notes: Vec<Note>) -> Result<()> {
        if self.state == ConnectionState::Online {
            match self.inner.replace_all(notes.clone()).await {
                Ok(()) => {
                    self.cache = notes
                        .into_iter()
                        .filter_map(|note| note.id.clone().map(|id| (id, note)))
                        .collect();
                    return Ok(());
                }
                Err(err) if err.is_connectivity() => self.go_offline(&err),
                Err(err) => return Err(err),
            }
        }
        for note in &notes {
            note.validate()?;
        }
        let stale: Vec<NoteId> = self.cache.keys().cloned().collect();
        for id in stale {
            self.enqueue(QueuedOperation::delete(id));
        }
        for mut note in notes {
            if note.id.is_none() {
                note.id = Some(NoteId::generate());
            }
            self.enqueue(QueuedOperation::save(note));
        }
        Ok(())
    }

    async fn is_connected(&mut self) -> bool {
        self.state == ConnectionState::Online
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::models::NoteState;

    /// In-memory backend whose connectivity can be toggled by the test.
    struct FlakyBackend {
        store: HashMap<NoteId, Note>,
        author: String,
        connected: Arc<AtomicBool>,
        assigns_ids: bool,
    }

    impl FlakyBackend {
        fn new(author: &str, connected: Arc<AtomicBool>) -> Self {
            Self {
                store: HashMap::new(),
                author: author.to_string(),
                connected,
                assigns_ids: false,
            }
        }

        /// Gateway-like flavor: client-supplied ids on create are
        /// discarded and a fresh one is assigned.
        fn authoritative(author: &str, connected: Arc<AtomicBool>) -> Self {
            Self {
                assigns_ids: true,
                ..Self::new(author, connected)
            }
        }

        fn check_link(&self) -> Result<()> {
            if self.connected.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::Connectivity("connection refused".into()))
            }
        }
    }

    #[async_trait]
    impl NoteBackend for FlakyBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::RemoteProxy
        }

        async fn setup(&mut self) -> Result<()> {
            self.check_link()
        }

        async fn load_all(&mut self) -> Result<()> {
            self.check_link()
        }

        async fn save_all(&mut self) -> Result<()> {
            self.check_link()
        }

        async fn get_all(&mut self) -> Result<Vec<Note>> {
            self.check_link()?;
            Ok(self.store.values().cloned().collect())
        }

        async fn get(&mut self, id: &NoteId) -> Result<Option<Note>> {
            self.check_link()?;
            Ok(self.store.get(id).cloned())
        }

        async fn save(&mut self, note: &mut Note) -> Result<()> {
            self.check_link()?;
            note.validate()?;
            if let Some(existing) = note.id.as_ref().and_then(|id| self.store.get(id)) {
                check_ownership(existing, &self.author)?;
            } else if self.assigns_ids {
                note.id = Some(NoteId::generate());
            }
            let id = note.id.clone().unwrap_or_else(NoteId::generate);
            note.id = Some(id.clone());
            self.store.insert(id, note.clone());
            Ok(())
        }

        async fn delete(&mut self, id: &NoteId) -> Result<()> {
            self.check_link()?;
            self.store
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(id.to_string()))
        }

        async fn add_reply(&mut self, note_id: &NoteId, reply: &mut Reply) -> Result<()> {
            self.check_link()?;
            let note = self
                .store
                .get_mut(note_id)
                .ok_or_else(|| Error::NotFound(note_id.to_string()))?;
            reply.id = Some(NoteId::generate());
            note.replies.push(reply.clone());
            Ok(())
        }

        async fn get_for_file(&mut self, path: &str) -> Result<Vec<Note>> {
            self.check_link()?;
            Ok(self
                .store
                .values()
                .filter(|note| note.file_path == path)
                .cloned()
                .collect())
        }

        async fn get_for_line(&mut self, path: &str, line: u32) -> Result<Vec<Note>> {
            self.check_link()?;
            Ok(self
                .store
                .values()
                .filter(|note| note.file_path == path && note.line_number == line)
                .cloned()
                .collect())
        }

        async fn clear(&mut self) -> Result<()> {
            self.check_link()?;
            self.store.clear();
            Ok(())
        }

        async fn force_flush(&mut self) -> Result<()> {
            self.check_link()
        }

        async fn stats(&mut self) -> Result<NoteStats> {
            self.check_link()?;
            let notes: Vec<Note> = self.store.values().cloned().collect();
            Ok(NoteStats::from_notes(&notes))
        }

        async fn replace_all(&mut self, notes: Vec<Note>) -> Result<()> {
            self.check_link()?;
            self.store = notes
                .into_iter()
                .filter_map(|note| note.id.clone().map(|id| (id, note)))
                .collect();
            Ok(())
        }

        async fn is_connected(&mut self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn controller(connected: &Arc<AtomicBool>) -> OfflineController {
        controller_over(FlakyBackend::new("alice", connected.clone()))
    }

    fn authoritative_controller(connected: &Arc<AtomicBool>) -> OfflineController {
        controller_over(FlakyBackend::authoritative("alice", connected.clone()))
    }

    fn controller_over(inner: FlakyBackend) -> OfflineController {
        let mut config = EngineConfig::local("demo", "alice");
        config.retry_base = Duration::from_millis(50);
        config.retry_max = Duration::from_millis(400);
        OfflineController::new(Box::new(inner), &config, NoteEvents::new())
    }

    fn todo_note() -> Note {
        Note::new("src/a.py", 3, "alice", "needs review", NoteState::Todo)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_round_trip() {
        let connected = Arc::new(AtomicBool::new(true));
        let mut controller = controller(&connected);
        controller.setup().await.unwrap();
        assert_eq!(controller.state(), ConnectionState::Online);

        // Disconnect, save: observable immediately, queued exactly once
        connected.store(false, Ordering::SeqCst);
        let mut note = todo_note();
        controller.save(&mut note).await.unwrap();
        assert_eq!(controller.state(), ConnectionState::Offline);
        assert_eq!(controller.queue_len(), 1);
        let visible = controller.get_all().await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].comment, "needs review");

        // Reconnect: authoritative store now holds the note, queue empty
        connected.store(true, Ordering::SeqCst);
        let report = controller.force_reconnect().await.unwrap().unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(controller.queue_len(), 0);
        assert_eq!(controller.state(), ConnectionState::Online);
        assert_eq!(controller.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fifo_replay_order_applies_later_writes_last() {
        let connected = Arc::new(AtomicBool::new(false));
        let mut controller = controller(&connected);
        controller.setup().await.unwrap();

        let mut note = todo_note();
        controller.save(&mut note).await.unwrap();
        note.comment = "second revision".to_string();
        controller.save(&mut note).await.unwrap();
        assert_eq!(controller.queue_len(), 2);

        connected.store(true, Ordering::SeqCst);
        let report = controller.force_reconnect().await.unwrap().unwrap();
        assert_eq!(report.replayed, 2);
        let notes = controller.get_all().await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].comment, "second revision");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_create_then_edit_converges_to_one_note() {
        let connected = Arc::new(AtomicBool::new(false));
        let mut controller = authoritative_controller(&connected);
        controller.setup().await.unwrap();

        let mut note = todo_note();
        controller.save(&mut note).await.unwrap();
        let provisional = note.id.clone().unwrap();
        note.comment = "second revision".to_string();
        controller.save(&mut note).await.unwrap();
        assert_eq!(controller.queue_len(), 2);

        connected.store(true, Ordering::SeqCst);
        let report = controller.force_reconnect().await.unwrap().unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.failed, 0);

        let notes = controller.get_all().await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].comment, "second revision");
        assert_ne!(notes[0].id.as_ref(), Some(&provisional));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_create_then_delete_leaves_nothing() {
        let connected = Arc::new(AtomicBool::new(false));
        let mut controller = authoritative_controller(&connected);
        controller.setup().await.unwrap();

        let mut note = todo_note();
        controller.save(&mut note).await.unwrap();
        controller.delete(note.id.as_ref().unwrap()).await.unwrap();
        assert_eq!(controller.queue_len(), 2);

        connected.store(true, Ordering::SeqCst);
        let report = controller.force_reconnect().await.unwrap().unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.failed, 0);
        assert!(controller.get_all().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_to_ceiling() {
        let connected = Arc::new(AtomicBool::new(false));
        let mut controller = controller(&connected);
        controller.setup().await.unwrap();
        assert_eq!(controller.retry_delay(), Duration::from_millis(50));

        // First trigger attempts right away and doubles the delay
        controller.maybe_reconnect().await.unwrap();
        assert_eq!(controller.retry_delay(), Duration::from_millis(100));

        // Each elapsed gate doubles again, capped at the ceiling
        for millis in [200, 400, 400] {
            tokio::time::advance(controller.retry_delay()).await;
            controller.maybe_reconnect().await.unwrap();
            assert_eq!(controller.retry_delay(), Duration::from_millis(millis));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_backoff_gate_skips_early_attempts() {
        let connected = Arc::new(AtomicBool::new(false));
        let mut controller = controller(&connected);
        controller.setup().await.unwrap();

        // First trigger attempts (no prior attempt recorded)
        controller.maybe_reconnect().await.unwrap();
        let delay_after_first = controller.retry_delay();

        // Immediate second trigger is gated and must not double the delay
        controller.maybe_reconnect().await.unwrap();
        assert_eq!(controller.retry_delay(), delay_after_first);

        // force_reconnect bypasses the gate regardless of elapsed time
        connected.store(true, Ordering::SeqCst);
        let report = controller.force_reconnect().await.unwrap();
        assert!(report.is_some());
        assert_eq!(controller.state(), ConnectionState::Online);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_ownership_still_enforced() {
        let connected = Arc::new(AtomicBool::new(true));
        let mut controller = controller(&connected);
        controller.setup().await.unwrap();

        // Seed a note owned by someone else via replace_all
        let mut seeded = Note::new("src/b.py", 1, "mallory", "someone else's", NoteState::Todo);
        seeded.id = Some(NoteId::from("m1"));
        controller.replace_all(vec![seeded]).await.unwrap();

        connected.store(false, Ordering::SeqCst);
        // Force the transition with a failing read
        controller.get_all().await.unwrap();
        assert!(matches!(
            controller.delete(&NoteId::from("m1")).await.unwrap_err(),
            Error::Ownership { .. }
        ));
        assert_eq!(controller.queue_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_replay_requeues_up_to_limit() {
        let connected = Arc::new(AtomicBool::new(false));
        let mut controller = controller(&connected);
        controller.setup().await.unwrap();

        // A queued save that will fail validation server-side forever:
        // sneak an invalid note into the queue via the offline path, then
        // corrupt it so the inner backend rejects it on every replay.
        let mut note = todo_note();
        controller.save(&mut note).await.unwrap();
        if let Some(op) = controller.queue.front_mut() {
            if let Some(queued) = op.note.as_mut() {
                queued.file_path = "/abs/path.py".to_string();
            }
        }

        connected.store(true, Ordering::SeqCst);
        let first = controller.force_reconnect().await.unwrap().unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(controller.queue_len(), 1, "re-queued for another attempt");

        connected.store(false, Ordering::SeqCst);
        controller.get_all().await.unwrap();
        connected.store(true, Ordering::SeqCst);
        controller.force_reconnect().await.unwrap();
        connected.store(false, Ordering::SeqCst);
        controller.get_all().await.unwrap();
        connected.store(true, Ordering::SeqCst);
        let last = controller.force_reconnect().await.unwrap().unwrap();
        assert_eq!(last.failed, 1);
        assert_eq!(controller.queue_len(), 0, "dropped after the attempt limit");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_offline_notification() {
        let connected = Arc::new(AtomicBool::new(true));
        let events = NoteEvents::new();
        let mut receiver = events.subscribe();
        let mut config = EngineConfig::local("demo", "alice");
        config.retry_base = Duration::from_millis(50);
        let mut controller = OfflineController::new(
            Box::new(FlakyBackend::new("alice", connected.clone())),
            &config,
            events,
        );
        controller.setup().await.unwrap();

        connected.store(false, Ordering::SeqCst);
        let mut first = todo_note();
        let mut second = todo_note();
        controller.save(&mut first).await.unwrap();
        controller.save(&mut second).await.unwrap();

        assert_eq!(receiver.recv().await.unwrap().kind, NoteEventKind::WentOffline);
        assert!(receiver.try_recv().is_err(), "only one offline notification");
    }
}
