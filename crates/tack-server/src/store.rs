//! SQLite persistence behind the gateway.
//!
//! Uses the same schema as the relational client backend so a gateway and a
//! direct-database client can point at the same file. The gateway is the
//! sole assigner of note ids; the version column is bumped here on every
//! successful update.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use tack_core::models::{ImportMetadata, Note, NoteSource, NoteState, NoteStats, Reply, Severity};
use tack_core::NoteId;

use crate::error::AppError;

const SCHEMA_VERSION: i64 = 1;

pub struct NoteStore {
    conn: Mutex<Connection>,
}

impl NoteStore {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, AppError> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("store mutex poisoned".into()))
    }

    pub fn notes_for_project(&self, project: &str) -> Result<Vec<Note>, AppError> {
        let conn = self.conn()?;
        let project_id = project_id(&conn, project)?;
        let Some(project_id) = project_id else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(
            "SELECT id, file_path, line_number, author, timestamp, updated_at,
                    version, comment, description, cwe, state, severity,
                    source, import_metadata
             FROM notes WHERE project_id = ?
             ORDER BY timestamp DESC",
        )?;
        let mut notes = stmt
            .query_map(params![project_id], parse_note)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for note in &mut notes {
            if let Some(id) = &note.id {
                note.replies = replies_for(&conn, id)?;
            }
        }
        Ok(notes)
    }

    pub fn note_by_id(&self, id: &NoteId) -> Result<Option<Note>, AppError> {
        let conn = self.conn()?;
        note_by_id(&conn, id)
    }

    pub fn create(&self, project: &str, mut note: Note) -> Result<Note, AppError> {
        let conn = self.conn()?;
        let project_id = ensure_project(&conn, project)?;
        // Ids are assigned here; anything the client sent is discarded
        let id = NoteId::from(Uuid::now_v7().to_string());
        note.id = Some(id.clone());
        note.version = 1;
        note.updated_at = None;
        insert_note(&conn, project_id, &note, &id)?;
        tracing::info!(
            note_id = %id,
            project,
            file = %note.file_path,
            line = note.line_number,
            "note created"
        );
        Ok(note)
    }

    pub fn update(&self, id: &NoteId, mut note: Note) -> Result<Note, AppError> {
        let conn = self.conn()?;
        let existing = note_by_id(&conn, id)?
            .ok_or_else(|| AppError::not_found(format!("note {id} does not exist")))?;
        if existing.author != note.author {
            return Err(AppError::forbidden(format!(
                "note {id} belongs to {}",
                existing.author
            )));
        }

        note.id = Some(id.clone());
        note.version = existing.version + 1;
        note.updated_at = Some(Utc::now());
        let rows = conn.execute(
            "UPDATE notes SET
                 file_path = ?, line_number = ?, comment = ?, description = ?,
                 cwe = ?, state = ?, severity = ?, source = ?,
                 import_metadata = ?, version = ?, updated_at = ?
             WHERE id = ?",
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
            ],
        )?;
        if rows == 0 {
            return Err(AppError::not_found(format!("note {id} does not exist")));
        }
        note.replies = replies_for(&conn, id)?;
        Ok(note)
    }

    /// Returns false when no note carried the id.
    pub fn delete_note(&self, id: &NoteId) -> Result<bool, AppError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM replies WHERE parent_id = ?", params![id.as_str()])?;
        let rows = conn.execute("DELETE FROM notes WHERE id = ?", params![id.as_str()])?;
        Ok(rows > 0)
    }

    pub fn clear_project(&self, project: &str) -> Result<u64, AppError> {
        let conn = self.conn()?;
        let Some(project_id) = project_id(&conn, project)? else {
            return Ok(0);
        };
        conn.execute(
            "DELETE FROM replies WHERE parent_id IN
                 (SELECT id FROM notes WHERE project_id = ?)",
            params![project_id],
        )?;
        let rows = conn.execute(
            "DELETE FROM notes WHERE project_id = ?",
            params![project_id],
        )?;
        Ok(rows as u64)
    }

    pub fn add_reply(&self, parent_id: &NoteId, mut reply: Reply) -> Result<Reply, AppError> {
        let conn = self.conn()?;
        if note_by_id(&conn, parent_id)?.is_none() {
            return Err(AppError::not_found(format!(
                "parent note {parent_id} does not exist"
            )));
        }
        let id = NoteId::from(Uuid::now_v7().to_string());
        reply.id = Some(id.clone());
        reply.parent_id = parent_id.clone();
        conn.execute(
            "INSERT INTO replies (id, parent_id, author, timestamp, comment)
             VALUES (?, ?, ?, ?, ?)",
            params![
                id.as_str(),
                parent_id.as_str(),
                reply.author,
                reply.timestamp.to_rfc3339(),
                reply.comment,
            ],
        )?;
        // Touch the parent so polling peers see the reply
        conn.execute(
            "UPDATE notes SET updated_at = ? WHERE id = ?",
            params![Utc::now().to_rfc3339(), parent_id.as_str()],
        )?;
        Ok(reply)
    }

    pub fn notes_for_file(&self, project: &str, path: &str) -> Result<Vec<Note>, AppError> {
        Ok(self
            .notes_for_project(project)?
            .into_iter()
            .filter(|note| note.file_path == path)
            .collect())
    }

    pub fn notes_for_line(
        &self,
        project: &str,
        path: &str,
        line: u32,
    ) -> Result<Vec<Note>, AppError> {
        Ok(self
            .notes_for_project(project)?
            .into_iter()
            .filter(|note| note.file_path == path && note.line_number == line)
            .collect())
    }

    pub fn stats(&self, project: &str) -> Result<NoteStats, AppError> {
        let conn = self.conn()?;
        let Some(project_id) = project_id(&conn, project)? else {
            return Ok(NoteStats {
                total_notes: 0,
                vulnerable: 0,
                not_vulnerable: 0,
                todo: 0,
                last_updated: None,
            });
        };
        let (total, vulnerable, not_vulnerable, todo, last_updated) = conn.query_row(
            "SELECT COUNT(*),
                    SUM(CASE WHEN state = 'vulnerable' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN state = 'not_vulnerable' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN state = 'todo' THEN 1 ELSE 0 END),
                    MAX(COALESCE(updated_at, timestamp))
             FROM notes WHERE project_id = ?",
            params![project_id],
            |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, Option<u64>>(1)?,
                    row.get::<_, Option<u64>>(2)?,
                    row.get::<_, Option<u64>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )?;
        Ok(NoteStats {
            total_notes: total,
            vulnerable: vulnerable.unwrap_or(0),
            not_vulnerable: not_vulnerable.unwrap_or(0),
            todo: todo.unwrap_or(0),
            last_updated: last_updated.as_deref().map(parse_ts),
        })
    }

    pub fn replace_all(&self, project: &str, notes: Vec<Note>) -> Result<Vec<Note>, AppError> {
        let conn = self.conn()?;
        let project_id = ensure_project(&conn, project)?;
        conn.execute(
            "DELETE FROM replies WHERE parent_id IN
                 (SELECT id FROM notes WHERE project_id = ?)",
            params![project_id],
        )?;
        conn.execute(
            "DELETE FROM notes WHERE project_id = ?",
            params![project_id],
        )?;

        let mut stored = Vec::with_capacity(notes.len());
        for mut note in notes {
            // Incoming ids survive so clients keep their cross-references
            let id = note
                .id
                .clone()
                .unwrap_or_else(|| NoteId::from(Uuid::now_v7().to_string()));
            note.id = Some(id.clone());
            insert_note(&conn, project_id, &note, &id)?;
            for reply in &note.replies {
                let reply_id = reply
                    .id
                    .clone()
                    .unwrap_or_else(|| NoteId::from(Uuid::now_v7().to_string()));
                conn.execute(
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
            stored.push(note);
        }
        Ok(stored)
    }
}

fn migrate(conn: &Connection) -> Result<(), AppError> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")?;
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

fn project_id(conn: &Connection, name: &str) -> Result<Option<i64>, AppError> {
    let mut stmt = conn.prepare("SELECT id FROM projects WHERE name = ?")?;
    let mut rows = stmt.query_map(params![name], |row| row.get(0))?;
    Ok(rows.next().transpose()?)
}

fn ensure_project(conn: &Connection, name: &str) -> Result<i64, AppError> {
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

fn note_by_id(conn: &Connection, id: &NoteId) -> Result<Option<Note>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT id, file_path, line_number, author, timestamp, updated_at,
                version, comment, description, cwe, state, severity,
                source, import_metadata
         FROM notes WHERE id = ?",
    )?;
    let mut rows = stmt.query_map(params![id.as_str()], parse_note)?;
    let Some(note) = rows.next().transpose()? else {
        return Ok(None);
    };
    drop(rows);
    drop(stmt);
    let mut note = note;
    note.replies = replies_for(conn, id)?;
    Ok(Some(note))
}

fn replies_for(conn: &Connection, parent_id: &NoteId) -> Result<Vec<Reply>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT id, parent_id, author, timestamp, comment
         FROM replies WHERE parent_id = ?
         ORDER BY timestamp",
    )?;
    let replies = stmt
        .query_map(params![parent_id.as_str()], |row| {
            Ok(Reply {
                id: Some(NoteId::from(row.get::<_, String>(0)?)),
                parent_id: NoteId::from(row.get::<_, String>(1)?),
                author: row.get(2)?,
                timestamp: parse_ts(&row.get::<_, String>(3)?),
                comment: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(replies)
}

fn insert_note(
    conn: &Connection,
    project_id: i64,
    note: &Note,
    id: &NoteId,
) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO notes (
             id, project_id, file_path, line_number, author, timestamp,
             updated_at, version, comment, description, cwe, state,
             severity, source, import_metadata
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id.as_str(),
            project_id,
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

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map_or_else(|_| Utc::now(), |ts| ts.with_timezone(&Utc))
}

fn enum_str<T: serde::Serialize>(value: &T) -> Result<String, AppError> {
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

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    fn store() -> (tempfile::TempDir, NoteStore) {
        let dir = tempdir().unwrap();
        let store = NoteStore::open(&dir.path().join("notes.db")).unwrap();
        (dir, store)
    }

    fn finding(author: &str) -> Note {
        Note::new(
            "src/login.py",
            12,
            author,
            "password compared without constant time",
            NoteState::Vulnerable,
        )
        .with_severity(Severity::High)
    }

    #[test]
    fn test_unknown_stored_state_is_an_error() {
        let (_dir, store) = store();
        store.create("webapp", finding("alice")).unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE notes SET state = 'maybe'", [])
            .unwrap();

        assert!(store.notes_for_project("webapp").is_err());
    }

    #[test]
    fn test_create_assigns_id_and_version() {
        let (_dir, store) = store();
        let mut note = finding("alice");
        note.id = Some(NoteId::from("client-made-up"));

        let created = store.create("demo", note).unwrap();
        let id = created.id.clone().unwrap();
        assert_ne!(id.as_str(), "client-made-up");
        assert_eq!(created.version, 1);
        assert_eq!(created.updated_at, None);

        let fetched = store.note_by_id(&id).unwrap().unwrap();
        assert_eq!(fetched.comment, created.comment);
    }

    #[test]
    fn test_update_bumps_version_and_checks_ownership() {
        let (_dir, store) = store();
        let created = store.create("demo", finding("alice")).unwrap();
        let id = created.id.clone().unwrap();

        let mut edit = created.clone();
        edit.comment = "confirmed, use hmac.compare_digest".to_string();
        let updated = store.update(&id, edit.clone()).unwrap();
        assert_eq!(updated.version, 2);
        assert!(updated.updated_at.is_some());

        edit.author = "mallory".to_string();
        let err = store.update(&id, edit).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[test]
    fn test_update_missing_note_is_not_found() {
        let (_dir, store) = store();
        let err = store
            .update(&NoteId::from("nope"), finding("alice"))
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_delete_and_clear() {
        let (_dir, store) = store();
        let a = store.create("demo", finding("alice")).unwrap();
        store.create("demo", finding("bob")).unwrap();
        store.create("other", finding("carol")).unwrap();

        assert!(store.delete_note(&a.id.clone().unwrap()).unwrap());
        assert!(!store.delete_note(&a.id.unwrap()).unwrap());

        assert_eq!(store.clear_project("demo").unwrap(), 1);
        assert_eq!(store.notes_for_project("demo").unwrap().len(), 0);
        assert_eq!(store.notes_for_project("other").unwrap().len(), 1);
    }

    #[test]
    fn test_replies_round_trip() {
        let (_dir, store) = store();
        let note = store.create("demo", finding("alice")).unwrap();
        let id = note.id.unwrap();

        let reply = Reply::new(id.clone(), "bob", "reproduced on main");
        let stored = store.add_reply(&id, reply).unwrap();
        assert!(stored.id.is_some());

        let fetched = store.note_by_id(&id).unwrap().unwrap();
        assert_eq!(fetched.replies.len(), 1);
        assert_eq!(fetched.replies[0].comment, "reproduced on main");

        let err = store
            .add_reply(&NoteId::from("nope"), Reply::new(id, "bob", "lost"))
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_stats_and_queries() {
        let (_dir, store) = store();
        store.create("demo", finding("alice")).unwrap();
        let mut todo = Note::new("src/auth.py", 4, "bob", "revisit", NoteState::Todo);
        todo = store.create("demo", todo).unwrap();
        store.update(&todo.id.clone().unwrap(), todo).unwrap();

        let stats = store.stats("demo").unwrap();
        assert_eq!(stats.total_notes, 2);
        assert_eq!(stats.vulnerable, 1);
        assert_eq!(stats.todo, 1);
        assert!(stats.last_updated.is_some());

        assert_eq!(store.notes_for_file("demo", "src/auth.py").unwrap().len(), 1);
        assert_eq!(
            store.notes_for_line("demo", "src/login.py", 12).unwrap().len(),
            1
        );
        assert_eq!(store.notes_for_line("demo", "src/login.py", 99).unwrap().len(), 0);
    }

    #[test]
    fn test_replace_all_preserves_ids() {
        let (_dir, store) = store();
        let kept = store.create("demo", finding("alice")).unwrap();
        let incoming = vec![kept.clone(), finding("bob")];

        let stored = store.replace_all("demo", incoming).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].id, kept.id);
        assert!(stored[1].id.is_some());
        assert_eq!(store.notes_for_project("demo").unwrap().len(), 2);
    }
}
