//! Relational storage: the authoritative multi-writer store.
//!
//! Backed by SQLite. Keeps a read cache keyed by id, refreshed wholesale on
//! `load_all`. Writes are write-through: every mutation hits the database
//! inside the ownership check, relying on row-level atomicity of the
//! conditional update scoped to `(id, project_id)` to defend against other
//! client processes.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{check_ownership, NoteBackend};
use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::models::{
    ImportMetadata, Note, NoteId, NoteSource, NoteState, NoteStats, Reply, Severity,
};

/// Current schema version
const SCHEMA_VERSION: i64 = 1;

pub struct RelationalBackend {
    db_path: PathBuf,
    project: String,
    author: String,
    conn: Option<Connection>,
    project_id: Option<i64>,
    cache: HashMap<NoteId, Note>,
}

impl RelationalBackend {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>, project: String, author: String) -> Self {
        Self {
            db_path: db_path.into(),
            project,
            author,
            conn: None,
            project_id: None,
            cache: HashMap::new(),
        }
    }

    /// In-memory database, useful for tests.
    #[must_use]
    pub fn in_memory(project: &str, author: &str) -> Self {
        Self::new(":memory:", project.to_string(), author.to_string())
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::Validation("relational backend used before setup()".into()))
    }

    fn project_id(&self) -> Result<i64> {
        self.project_id
            .ok_or_else(|| Error::Validation("relational backend used before setup()".into()))
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        )?;
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE projects (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     name TEXT NOT NULL UNIQUE,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE notes (
                     id TEXT NOT NULL,
                     project_id INTEGER NOT NULL REFERENCES projects(id),
                     file_path TEXT NOT NULL,
                     line_number INTEGER NOT NULL,
                     author TEXT NOT NULL,
                     timestamp TEXT NOT NULL,
                     updated_at TEXT,
                     version INTEGER NOT NULL DEFAULT 1,
                     comment TEXT NOT NULL,
                     description TEXT,
                     cwe TEXT,
                     state TEXT NOT NULL,
                     severity TEXT,
                     source TEXT NOT NULL DEFAULT 'native',
                     import_metadata TEXT,
                     PRIMARY KEY (id, project_id)
                 );
                 CREATE INDEX idx_notes_file ON notes(project_id, file_path);
                 CREATE TABLE replies (
                     id TEXT PRIMARY KEY,
                     parent_id TEXT NOT NULL,
                     author TEXT NOT NULL,
                     timestamp TEXT NOT NULL,
                     comment TEXT NOT NULL
                 );
                 CREATE INDEX idx_replies_parent ON replies(parent_id);",
            )?;
        }

        conn.execute("DELETE FROM schema_version", [])?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    fn ensure_project(conn: &Connection, name: &str) -> Result<i64> {
        conn.execute(
            "INSERT OR IGNORE INTO projects (name, created_at) VALUES (?, ?)",
            params![name, Utc::now().to_rfc3339()],
        )?;
        let id = conn.query_row(
            "SELECT id FROM projects WHERE name = ?",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn parse_note(row: &rusqlite::Row<'_>) -> rusqlite::Result<Note> {
        let state: String = row.get(10)?;
        let severity: Option<String> = row.get(11)?;
        let source: String = row.get(12)?;
        let import_metadata: Option<String> = row.get(13)?;
        Ok(Note {
            id: Some(NoteId::from(row.get::<_, String>(0)?)),
            file_path: row.get(1)?,
            line_number: row.get(2)?,
            author: row.get(3)?,
            timestamp: parse_ts(&row.get::<_, String>(4)?),
            updated_at: row.get::<_, Option<String>>(5)?.map(|ts| parse_ts(&ts)),
            version: row.get(6)?,
            comment: row.get(7)?,
            description: row.get(8)?,
            cwe: row.get(9)?,
            state: parse_enum(10, &state)?,
            severity: severity
                .as_deref()
                .map(|raw| parse_enum(11, raw))
                .transpose()?,
            source: parse_enum(12, &source)?,
            import_metadata: import_metadata
                .as_deref()
                .and_then(|json| serde_json::from_str::<ImportMetadata>(json).ok()),
            replies: Vec::new(),
        })
    }

    fn insert_note(&self, note: &Note, id: &NoteId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notes (
                 id, project_id, file_path, line_number, author, timestamp,
                 updated_at, version, comment, description, cwe, state,
                 severity, source, import_metadata
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id.as_str(),
                self.project_id()?,
                note.file_path,
                note.line_number,
                note.author,
                note.timestamp.to_rfc3339(),
                note.updated_at.map(|ts| ts.to_rfc3339()),
                note.version,
                note.comment,
                note.description,
                note.cwe,
                enum_str(&note.state)?,
                note.severity.map(|sev| sev.to_string()),
                enum_str(&note.source)?,
                note.import_metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        )?;
        Ok(())
    }

    fn refresh_cache(&mut self) -> Result<()> {
        let project_id = self.project_id()?;
        let cache: HashMap<NoteId, Note> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, file_path, line_number, author, timestamp, updated_at,
                        version, comment, description, cwe, state, severity,
                        source, import_metadata
                 FROM notes WHERE project_id = ?",
            )?;
            let notes = stmt
                .query_map(params![project_id], Self::parse_note)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut cache: HashMap<NoteId, Note> = notes
                .into_iter()
                .filter_map(|note| note.id.clone().map(|id| (id, note)))
                .collect();

            let mut stmt = conn.prepare(
                "SELECT r.id, r.parent_id, r.author, r.timestamp, r.comment
                 FROM replies r
                 JOIN notes n ON n.id = r.parent_id
                 WHERE n.project_id = ?
                 ORDER BY r.timestamp",
            )?;
            let replies = stmt
                .query_map(params![project_id], |row| {
                    Ok(Reply {
                        id: Some(NoteId::from(row.get::<_, String>(0)?)),
                        parent_id: NoteId::from(row.get::<_, String>(1)?),
                        author: row.get(2)?,
                        timestamp: parse_ts(&row.get::<_, String>(3)?),
                        comment: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for reply in replies {
                if let Some(note) = cache.get_mut(&reply.parent_id) {
                    note.replies.push(reply);
                }
            }
            cache
        };

        self.cache = cache;
        Ok(())
    }

    fn sorted_notes(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = self.cache.values().cloned().collect();
        notes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        notes
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map_or_else(|_| Utc::now(), |ts| ts.with_timezone(&Utc))
}

/// Serde-backed string form of a unit enum, without the JSON quotes
fn enum_str<T: serde::Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    Ok(json.trim_matches('"').to_string())
}

/// Inverse of `enum_str`. An unrecognized stored value is corruption, not
/// something to paper over with a default.
fn parse_enum<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(&format!("\"{raw}\"")).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

#[async_trait]
impl NoteBackend for RelationalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    async fn setup(&mut self) -> Result<()> {
        let conn = if self.db_path.as_os_str() == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(&self.db_path)?
        };
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::migrate(&conn)?;
        let project_id = Self::ensure_project(&conn, &self.project)?;
        self.conn = Some(conn);
        self.project_id = Some(project_id);
        self.refresh_cache()
    }

    async fn load_all(&mut self) -> Result<()> {
        self.refresh_cache()
    }

    async fn save_all(&mut self) -> Result<()> {
        // Writes are write-through; nothing is pending
        Ok(())
    }

    async fn get_all(&mut self) -> Result<Vec<Note>> {
        Ok(self.sorted_notes())
    }

    async fn get(&mut self, id: &NoteId) -> Result<Option<Note>> {
        Ok(self.cache.get(id).cloned())
    }

    async fn save(&mut self, note: &mut Note) -> Result<()> {
        note.validate()?;
        let is_update = note
            .id
            .as_ref()
            .is_some_and(|id| self.cache.contains_key(id));

        if is_update {
            let id = note.id.clone().unwrap_or_else(NoteId::generate);
            let existing = &self.cache[&id];
            check_ownership(existing, &self.author)?;
            note.version = existing.version + 1;
            note.updated_at = Some(Utc::now());

            let project_id = self.project_id()?;
            let rows = self.conn()?.execute(
                "UPDATE notes SET
                     file_path = ?, line_number = ?, comment = ?, description = ?,
                     cwe = ?, state = ?, severity = ?, source = ?,
                     import_metadata = ?, version = ?, updated_at = ?
                 WHERE id = ? AND project_id = ?",
                params![
                    note.file_path,
                    note.line_number,
                    note.comment,
                    note.description,
                    note.cwe,
                    enum_str(&note.state)?,
                    note.severity.map(|sev| sev.to_string()),
                    enum_str(&note.source)?,
                    note.import_metadata
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    note.version,
                    note.updated_at.map(|ts| ts.to_rfc3339()),
                    id.as_str(),
                    project_id,
                ],
            )?;
            if rows == 0 {
                return Err(Error::NotFound(id.to_string()));
            }
            self.cache.insert(id, note.clone());
        } else {
            let id = note.id.clone().unwrap_or_else(NoteId::generate);
            note.id = Some(id.clone());
            self.insert_note(note, &id)?;
            self.cache.insert(id, note.clone());
        }
        Ok(())
    }

    async fn delete(&mut self, id: &NoteId) -> Result<()> {
        let existing = self
            .cache
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        check_ownership(existing, &self.author)?;
        let project_id = self.project_id()?;
        let conn = self.conn()?;
        conn.execute("DELETE FROM replies WHERE parent_id = ?", params![id.as_str()])?;
        conn.execute(
            "DELETE FROM notes WHERE id = ? AND project_id = ?",
            params![id.as_str(), project_id],
        )?;
        self.cache.remove(id);
        Ok(())
    }

    async fn add_reply(&mut self, note_id: &NoteId, reply: &mut Reply) -> Result<()> {
        if !self.cache.contains_key(note_id) {
            return Err(Error::NotFound(note_id.to_string()));
        }
        if reply.id.is_none() {
            reply.id = Some(NoteId::generate());
        }
        self.conn()?.execute(
            "INSERT INTO replies (id, parent_id, author, timestamp, comment)
             VALUES (?, ?, ?, ?, ?)",
            params![
                reply.id.as_ref().map(NoteId::as_str),
                note_id.as_str(),
                reply.author,
                reply.timestamp.to_rfc3339(),
                reply.comment,
            ],
        )?;
        // Touch the parent so polling peers see the reply
        let touched = Utc::now();
        self.conn()?.execute(
            "UPDATE notes SET updated_at = ? WHERE id = ? AND project_id = ?",
            params![touched.to_rfc3339(), note_id.as_str(), self.project_id()?],
        )?;
        if let Some(note) = self.cache.get_mut(note_id) {
            note.replies.push(reply.clone());
            note.updated_at = Some(touched);
        }
        Ok(())
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
        let project_id = self.project_id()?;
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM replies WHERE parent_id IN
             (SELECT id FROM notes WHERE project_id = ?)",
            params![project_id],
        )?;
        conn.execute("DELETE FROM notes WHERE project_id = ?", params![project_id])?;
        self.cache.clear();
        Ok(())
    }

    async fn force_flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stats(&mut self) -> Result<NoteStats> {
        // Queried from the database, not the cache, so concurrent writers
        // move the high-water mark the sync dispatcher polls on.
        let project_id = self.project_id()?;
        let conn = self.conn()?;
        let (total, vulnerable, not_vulnerable, todo): (u64, u64, u64, u64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(state = 'vulnerable'), 0),
                    COALESCE(SUM(state = 'not_vulnerable'), 0),
                    COALESCE(SUM(state = 'todo'), 0)
             FROM notes WHERE project_id = ?",
            params![project_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        let last_updated: Option<String> = conn.query_row(
            "SELECT MAX(COALESCE(updated_at, timestamp)) FROM notes WHERE project_id = ?",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(NoteStats {
            total_notes: total,
            vulnerable,
            not_vulnerable,
            todo,
            last_updated: last_updated.as_deref().map(parse_ts),
        })
    }

    async fn replace_all(&mut self, notes: Vec<Note>) -> Result<()> {
        for note in &notes {
            note.validate()?;
        }
        let project_id = self.project_id()?;
        {
            let conn = self.conn()?;
            conn.execute(
                "DELETE FROM replies WHERE parent_id IN
                 (SELECT id FROM notes WHERE project_id = ?)",
                params![project_id],
            )?;
            conn.execute("DELETE FROM notes WHERE project_id = ?", params![project_id])?;
        }
        for mut note in notes {
            let id = note.id.take().unwrap_or_else(NoteId::generate);
            note.id = Some(id.clone());
            self.insert_note(&note, &id)?;
            for reply in &note.replies {
                let reply_id = reply
                    .id
                    .clone()
                    .unwrap_or_else(NoteId::generate);
                self.conn()?.execute(
                    "INSERT INTO replies (id, parent_id, author, timestamp, comment)
                     VALUES (?, ?, ?, ?, ?)",
                    params![
                        reply_id.as_str(),
                        id.as_str(),
                        reply.author,
                        reply.timestamp.to_rfc3339(),
                        reply.comment,
                    ],
                )?;
            }
            self.cache.insert(id, note);
        }
        self.refresh_cache()
    }

    async fn is_connected(&mut self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| conn.query_row("SELECT 1", [], |_| Ok(())).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup(author: &str) -> RelationalBackend {
        let mut backend = RelationalBackend::in_memory("demo", author);
        backend.setup().await.unwrap();
        backend
    }

    fn vulnerable(path: &str, line: u32, author: &str) -> Note {
        Note::new(path, line, author, "sql injection", NoteState::Vulnerable)
            .with_severity(Severity::High)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_update_cycle() {
        let mut backend = setup("alice").await;
        let mut note = vulnerable("src/a.py", 10, "alice");
        backend.save(&mut note).await.unwrap();
        assert_eq!(note.version, 1);
        let id = note.id.clone().unwrap();

        note.comment = "confirmed sql injection".to_string();
        backend.save(&mut note).await.unwrap();
        assert_eq!(note.version, 2);
        assert!(note.updated_at.is_some());

        let stored = backend.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.comment, "confirmed sql injection");
        assert_eq!(stored.version, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ownership_blocks_other_identities() {
        let mut alice = setup("alice").await;
        let mut note = vulnerable("src/a.py", 10, "alice");
        alice.save(&mut note).await.unwrap();
        let id = note.id.clone().unwrap();

        // Same database handle re-scoped as bob
        alice.author = "bob".to_string();
        let mut tampered = note.clone();
        tampered.comment = "downgraded".to_string();
        assert!(matches!(
            alice.save(&mut tampered).await.unwrap_err(),
            Error::Ownership { .. }
        ));
        assert!(matches!(
            alice.delete(&id).await.unwrap_err(),
            Error::Ownership { .. }
        ));
        assert_eq!(
            alice.get(&id).await.unwrap().unwrap().comment,
            "sql injection"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_load_all_round_trips_replies_and_metadata() {
        let mut backend = setup("alice").await;
        let mut note = vulnerable("src/a.py", 10, "alice");
        note.cwe = Some("CWE-89".to_string());
        note.source = NoteSource::Imported;
        note.import_metadata = Some(ImportMetadata {
            tool: "semgrep".to_string(),
            source_file: Some("report.sarif".to_string()),
            rule_id: Some("sqli.tainted".to_string()),
        });
        backend.save(&mut note).await.unwrap();
        let id = note.id.clone().unwrap();
        let mut reply = Reply::new(id.clone(), "bob", "reproduced");
        backend.add_reply(&id, &mut reply).await.unwrap();

        backend.load_all().await.unwrap();
        let stored = backend.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.cwe.as_deref(), Some("CWE-89"));
        assert_eq!(stored.source, NoteSource::Imported);
        assert_eq!(stored.import_metadata.as_ref().unwrap().tool, "semgrep");
        assert_eq!(stored.replies.len(), 1);
        assert_eq!(stored.replies[0].comment, "reproduced");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_load_all_survives_concurrent_writer_rows() {
        // Rows inserted behind the cache's back must parse on the next refresh.
        let mut backend = setup("alice").await;
        let mut note = vulnerable("src/a.py", 10, "alice");
        note.cwe = Some("CWE-89".to_string());
        backend.save(&mut note).await.unwrap();
        let id = note.id.clone().unwrap();

        backend.cache.clear();
        backend.load_all().await.unwrap();
        let stored = backend.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.state, NoteState::Vulnerable);
        assert_eq!(stored.severity, Some(Severity::High));
        assert_eq!(stored.source, NoteSource::Native);
        assert_eq!(stored.cwe.as_deref(), Some("CWE-89"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_stored_state_is_an_error() {
        let mut backend = setup("alice").await;
        let mut note = vulnerable("src/a.py", 10, "alice");
        backend.save(&mut note).await.unwrap();
        backend
            .conn()
            .unwrap()
            .execute("UPDATE notes SET state = 'maybe'", [])
            .unwrap();

        assert!(matches!(
            backend.load_all().await.unwrap_err(),
            Error::Database(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stats_reflect_database_state() {
        let mut backend = setup("alice").await;
        let mut a = vulnerable("src/a.py", 1, "alice");
        let mut b = Note::new("src/b.py", 2, "alice", "revisit", NoteState::Todo);
        backend.save(&mut a).await.unwrap();
        backend.save(&mut b).await.unwrap();

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.total_notes, 2);
        assert_eq!(stats.vulnerable, 1);
        assert_eq!(stats.todo, 1);
        assert!(stats.last_updated.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replace_all_idempotent() {
        let mut backend = setup("alice").await;
        let mut a = vulnerable("src/a.py", 1, "alice");
        a.id = Some(NoteId::from("n-a"));
        let mut b = Note::new("src/b.py", 2, "bob", "todo item", NoteState::Todo);
        b.id = Some(NoteId::from("n-b"));

        backend.replace_all(vec![a.clone(), b.clone()]).await.unwrap();
        let first = backend.get_all().await.unwrap();
        backend.replace_all(vec![a, b]).await.unwrap();
        let second = backend.get_all().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_for_file_and_line() {
        let mut backend = setup("alice").await;
        let mut a = vulnerable("src/a.py", 5, "alice");
        let mut b = vulnerable("src/a.py", 9, "alice");
        let mut c = vulnerable("src/c.py", 5, "alice");
        for note in [&mut a, &mut b, &mut c] {
            backend.save(note).await.unwrap();
        }

        let file_notes = backend.get_for_file("src/a.py").await.unwrap();
        assert_eq!(file_notes.len(), 2);
        assert_eq!(file_notes[0].line_number, 5);

        let line_notes = backend.get_for_line("src/a.py", 9).await.unwrap();
        assert_eq!(line_notes.len(), 1);
    }
}
