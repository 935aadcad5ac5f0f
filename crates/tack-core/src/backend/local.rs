//! Local file-backed storage.
//!
//! One JSON file per project, single writer, authoritative in single-user
//! mode: it assigns ids, bumps versions, and sets `updated_at` itself.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::Utc;

use super::{check_ownership, NoteBackend};
use crate::config::{BackendKind, EngineConfig};
use crate::error::{Error, Result};
use crate::models::{Note, NoteId, NoteStats, Reply};

const NOTES_SUFFIX: &str = ".tack.json";

pub struct LocalBackend {
    dir: PathBuf,
    explicit_file: Option<String>,
    project: String,
    author: String,
    auto_flush: bool,
    cache: HashMap<NoteId, Note>,
    resolved: Option<PathBuf>,
}

impl LocalBackend {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        let dir = config
            .notes_dir
            .clone()
            .map_or_else(|| PathBuf::from("."), PathBuf::from);
        Self {
            dir,
            explicit_file: config.notes_file.clone(),
            project: config.project.clone(),
            author: config.author.clone(),
            auto_flush: config.auto_flush,
            cache: HashMap::new(),
            resolved: None,
        }
    }

    /// Pick the notes file: the configured name when present, otherwise the
    /// most recently modified matching file in the directory. Projects that
    /// accumulated historical snapshots keep working against the newest one.
    fn discover_file(&self) -> PathBuf {
        if let Some(name) = &self.explicit_file {
            return self.dir.join(name);
        }

        let default = self.dir.join(format!("{}{NOTES_SUFFIX}", self.project));
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return default;
        };

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !name.ends_with(NOTES_SUFFIX) {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
                continue;
            };
            if newest.as_ref().is_none_or(|(seen, _)| modified > *seen) {
                newest = Some((modified, path));
            }
        }
        newest.map_or(default, |(_, path)| path)
    }

    fn file_path(&mut self) -> PathBuf {
        if let Some(path) = &self.resolved {
            return path.clone();
        }
        let path = self.discover_file();
        self.resolved = Some(path.clone());
        path
    }

    fn flush(&mut self) -> Result<()> {
        let path = self.file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut notes: Vec<&Note> = self.cache.values().collect();
        notes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let json = serde_json::to_string_pretty(&notes)?;
        // Write-then-rename so a crash mid-write never truncates the store
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.auto_flush {
            self.flush()?;
        }
        Ok(())
    }

    fn sorted_notes(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = self.cache.values().cloned().collect();
        notes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        notes
    }
}

#[async_trait]
impl NoteBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn setup(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.file_path();
        tracing::debug!(path = %path.display(), "local backend using notes file");
        self.load_all().await
    }

    async fn load_all(&mut self) -> Result<()> {
        let path = self.file_path();
        if !Path::new(&path).exists() {
            self.cache.clear();
            return Ok(());
        }
        let json = fs::read_to_string(&path)?;
        let notes: Vec<Note> = serde_json::from_str(&json)?;
        self.cache = notes
            .into_iter()
            .filter_map(|note| note.id.clone().map(|id| (id, note)))
            .collect();
        Ok(())
    }

    async fn save_all(&mut self) -> Result<()> {
        self.flush()
    }

    async fn get_all(&mut self) -> Result<Vec<Note>> {
        Ok(self.sorted_notes())
    }

    async fn get(&mut self, id: &NoteId) -> Result<Option<Note>> {
        Ok(self.cache.get(id).cloned())
    }

    async fn save(&mut self, note: &mut Note) -> Result<()> {
        note.validate()?;
        match &note.id {
            Some(id) => {
                if let Some(existing) = self.cache.get(id) {
                    check_ownership(existing, &self.author)?;
                    note.version = existing.version + 1;
                    note.updated_at = Some(Utc::now());
                }
                self.cache.insert(id.clone(), note.clone());
            }
            None => {
                let id = NoteId::generate();
                note.id = Some(id.clone());
                note.version = 1;
                self.cache.insert(id, note.clone());
            }
        }
        self.maybe_flush()
    }

    async fn delete(&mut self, id: &NoteId) -> Result<()> {
        let existing = self
            .cache
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        check_ownership(existing, &self.author)?;
        self.cache.remove(id);
        self.maybe_flush()
    }

    async fn add_reply(&mut self, note_id: &NoteId, reply: &mut Reply) -> Result<()> {
        let note = self
            .cache
            .get_mut(note_id)
            .ok_or_else(|| Error::NotFound(note_id.to_string()))?;
        if reply.id.is_none() {
            reply.id = Some(NoteId::generate());
        }
        note.replies.push(reply.clone());
        self.maybe_flush()
    }

    async fn get_for_file(&mut self, path: &str) -> Result<Vec<Note>> {
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
        self.cache.clear();
        self.maybe_flush()
    }

    async fn force_flush(&mut self) -> Result<()> {
        self.flush()
    }

    async fn stats(&mut self) -> Result<NoteStats> {
        Ok(NoteStats::from_notes(&self.sorted_notes()))
    }

    async fn replace_all(&mut self, notes: Vec<Note>) -> Result<()> {
        for note in &notes {
            note.validate()?;
        }
        self.cache = notes
            .into_iter()
            .map(|mut note| {
                let id = note.id.take().unwrap_or_else(NoteId::generate);
                note.id = Some(id.clone());
                (id, note)
            })
            .collect();
        self.flush()
    }

    async fn is_connected(&mut self) -> bool {
        true
    }
}
