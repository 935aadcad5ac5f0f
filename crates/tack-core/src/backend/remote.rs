//! Remote-proxy storage: a client of the collaboration gateway.
//!
//! Issues request/response calls against the stateless HTTP gateway in
//! front of the relational store. The server is the sole assigner of ids
//! on create; a locally generated id is never sent. After every successful
//! mutation the full project note set is reloaded so the cache can never
//! drift from the authoritative store.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{check_ownership, NoteBackend};
use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::models::{Note, NoteId, NoteStats, Reply};

pub struct RemoteBackend {
    base_url: String,
    project: String,
    author: String,
    client: reqwest::Client,
    cache: HashMap<NoteId, Note>,
}

#[derive(Serialize)]
struct NoteBody<'a> {
    #[serde(flatten)]
    note: &'a Note,
    project_name: &'a str,
}

#[derive(Deserialize)]
struct NotesResponse {
    notes: Vec<Note>,
}

#[derive(Deserialize)]
struct NoteResponse {
    note: Note,
}

#[derive(Serialize, Deserialize)]
struct ReplaceBody {
    notes: Vec<Note>,
}

#[derive(Deserialize)]
struct StatsResponse {
    total_notes: u64,
    #[serde(default)]
    vulnerable: u64,
    #[serde(default)]
    not_vulnerable: u64,
    #[serde(default)]
    todo: u64,
    #[serde(default)]
    last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    detail: Option<String>,
}

impl RemoteBackend {
    pub fn new(base_url: String, project: String, author: String) -> Result<Self> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::Validation(format!(
                "gateway URL must include http:// or https://, got '{base_url}'"
            )));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            project,
            author,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()?,
            cache: HashMap::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{path}", self.base_url)
    }

    /// Map a non-success response onto the error taxonomy. 5xx is a
    /// connectivity failure so the offline controller takes over.
    async fn fail(&self, response: Response) -> Error {
        let status = response.status();
        let message = response
            .text()
            .await
            .ok()
            .and_then(|body| {
                serde_json::from_str::<ErrorBody>(&body)
                    .ok()
                    .and_then(|parsed| parsed.error.or(parsed.detail))
                    .or_else(|| {
                        let trimmed = body.trim().to_string();
                        (!trimmed.is_empty()).then_some(trimmed)
                    })
            })
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

        match status {
            StatusCode::NOT_FOUND => Error::NotFound(message),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Error::Ownership {
                id: String::new(),
                owner: message,
                caller: self.author.clone(),
            },
            StatusCode::CONFLICT => Error::Conflict(message),
            status if status.is_server_error() => {
                Error::Connectivity(format!("{message} ({})", status.as_u16()))
            }
            status => Error::Validation(format!("{message} ({})", status.as_u16())),
        }
    }

    async fn fetch_notes(&self, path: &str) -> Result<Vec<Note>> {
        let response = self.client.get(self.url(path)).send().await?;
        if !response.status().is_success() {
            return Err(self.fail(response).await);
        }
        Ok(response.json::<NotesResponse>().await?.notes)
    }

    async fn reload(&mut self) -> Result<()> {
        let notes = self
            .fetch_notes(&format!("/notes/{}", self.project))
            .await?;
        self.cache = notes
            .into_iter()
            .filter_map(|note| note.id.clone().map(|id| (id, note)))
            .collect();
        Ok(())
    }

    fn sorted_notes(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = self.cache.values().cloned().collect();
        notes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        notes
    }
}

#[async_trait]
impl NoteBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteProxy
    }

    async fn setup(&mut self) -> Result<()> {
        let response = self.client.get(self.url("/health")).send().await?;
        if !response.status().is_success() {
            return Err(Error::Connectivity(format!(
                "gateway health check failed with HTTP {}",
                response.status().as_u16()
            )));
        }
        tracing::debug!(url = %self.base_url, "gateway reachable");
        self.reload().await
    }

    async fn load_all(&mut self) -> Result<()> {
        self.reload().await
    }

    async fn save_all(&mut self) -> Result<()> {
        // The gateway persists every mutation immediately
        Ok(())
    }

    async fn get_all(&mut self) -> Result<Vec<Note>> {
        Ok(self.sorted_notes())
    }

    async fn get(&mut self, id: &NoteId) -> Result<Option<Note>> {
        let response = self
            .client
            .get(self.url(&format!("/notes/note/{id}")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(self.fail(response).await);
        }
        Ok(Some(response.json::<NoteResponse>().await?.note))
    }

    async fn save(&mut self, note: &mut Note) -> Result<()> {
        note.validate()?;
        let existing_id = note
            .id
            .clone()
            .filter(|id| self.cache.contains_key(id));

        let saved = if let Some(id) = existing_id {
            check_ownership(&self.cache[&id], &self.author)?;
            let response = self
                .client
                .put(self.url(&format!("/notes/{id}")))
                .json(&NoteBody {
                    note,
                    project_name: &self.project,
                })
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(self.fail(response).await);
            }
            response.json::<NoteResponse>().await?.note
        } else {
            // The server assigns the id; never send a locally generated one
            let mut fresh = note.clone();
            fresh.id = None;
            let response = self
                .client
                .post(self.url("/notes"))
                .json(&NoteBody {
                    note: &fresh,
                    project_name: &self.project,
                })
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(self.fail(response).await);
            }
            response.json::<NoteResponse>().await?.note
        };

        note.id = saved.id.clone();
        note.version = saved.version;
        note.updated_at = saved.updated_at;
        self.reload().await
    }

    async fn delete(&mut self, id: &NoteId) -> Result<()> {
        let existing = self
            .cache
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        check_ownership(existing, &self.author)?;
        let response = self
            .client
            .delete(self.url(&format!("/notes/{id}")))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.fail(response).await);
        }
        self.reload().await
    }

    async fn add_reply(&mut self, note_id: &NoteId, reply: &mut Reply) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/notes/{note_id}/replies")))
            .json(&*reply)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.fail(response).await);
        }
        #[derive(Deserialize)]
        struct ReplyResponse {
            reply: Reply,
        }
        *reply = response.json::<ReplyResponse>().await?.reply;
        self.reload().await
    }

    async fn get_for_file(&mut self, path: &str) -> Result<Vec<Note>> {
        let response = self
            .client
            .get(self.url(&format!("/notes/{}/file", self.project)))
            .query(&[("path", path)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.fail(response).await);
        }
        Ok(response.json::<NotesResponse>().await?.notes)
    }

    async fn get_for_line(&mut self, path: &str, line: u32) -> Result<Vec<Note>> {
        let response = self
            .client
            .get(self.url(&format!("/notes/{}/line", self.project)))
            .query(&[("path", path.to_string()), ("line", line.to_string())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.fail(response).await);
        }
        Ok(response.json::<NotesResponse>().await?.notes)
    }

    async fn clear(&mut self) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/notes/{}", self.project)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.fail(response).await);
        }
        self.cache.clear();
        Ok(())
    }

    async fn force_flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stats(&mut self) -> Result<NoteStats> {
        let response = self
            .client
            .get(self.url(&format!("/stats/{}", self.project)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.fail(response).await);
        }
        let stats = response.json::<StatsResponse>().await?;
        Ok(NoteStats {
            total_notes: stats.total_notes,
            vulnerable: stats.vulnerable,
            not_vulnerable: stats.not_vulnerable,
            todo: stats.todo,
            last_updated: stats.last_updated,
        })
    }

    async fn replace_all(&mut self, notes: Vec<Note>) -> Result<()> {
        for note in &notes {
            note.validate()?;
        }
        let response = self
            .client
            .put(self.url(&format!("/notes/{}/replace", self.project)))
            .json(&ReplaceBody { notes })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.fail(response).await);
        }
        self.reload().await
    }

    async fn is_connected(&mut self) -> bool {
        match self.client.get(self.url("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
