//! Subscribe/notify channel between the engine and its presentation layer.
//!
//! The engine never renders anything; it publishes typed events and the UI
//! layer subscribes. Backed by a broadcast channel so multiple observers
//! (statusline, sign column, ...) can listen independently.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteEventKind {
    NoteCreated,
    NoteUpdated,
    NoteDeleted,
    ReplyAdded,
    /// Remote changes were pulled and applied to the local cache
    SyncApplied,
    WentOffline,
    BackOnline,
}

/// Typed notification payload delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub kind: NoteEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// Originating client instance, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl NoteEvent {
    #[must_use]
    pub fn bare(kind: NoteEventKind) -> Self {
        Self {
            kind,
            note_id: None,
            file_path: None,
            line_number: None,
            author: None,
            version: None,
            session_id: None,
        }
    }
}

/// Cloneable event hub.
#[derive(Debug, Clone)]
pub struct NoteEvents {
    sender: broadcast::Sender<NoteEvent>,
}

impl NoteEvents {
    #[must_use]
    pub fn new() -> Self {
        // Slow observers drop old events rather than backpressuring the engine
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NoteEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: NoteEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for NoteEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_all_subscribers_receive() {
        let events = NoteEvents::new();
        let mut first = events.subscribe();
        let mut second = events.subscribe();

        events.emit(NoteEvent::bare(NoteEventKind::SyncApplied));
        assert_eq!(first.recv().await.unwrap().kind, NoteEventKind::SyncApplied);
        assert_eq!(second.recv().await.unwrap().kind, NoteEventKind::SyncApplied);
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let events = NoteEvents::new();
        events.emit(NoteEvent::bare(NoteEventKind::WentOffline));
    }
}
