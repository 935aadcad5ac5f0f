use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tack_core::models::{Note, Reply};
use tack_core::NoteId;

use crate::error::AppError;
use crate::store::NoteStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<NoteStore>,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/notes", post(create_note))
        .route("/api/notes/note/{id}", get(get_note))
        // The bare key is a project name on GET, a note id on PUT, and
        // either on DELETE (note id first, else clear the project)
        .route(
            "/api/notes/{key}",
            get(get_project_notes)
                .put(update_note)
                .delete(delete_note_or_clear),
        )
        .route("/api/notes/{key}/replies", post(create_reply))
        .route("/api/notes/{key}/file", get(get_file_notes))
        .route("/api/notes/{key}/line", get(get_line_notes))
        .route("/api/notes/{key}/replace", put(replace_notes))
        .route("/api/stats/{project}", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

/// A note as it travels over the wire, tagged with its project.
#[derive(Debug, Deserialize)]
struct NotePayload {
    #[serde(flatten)]
    note: Note,
    project_name: String,
}

#[derive(Debug, Serialize)]
struct NoteResponse {
    note: Note,
}

#[derive(Debug, Serialize, Deserialize)]
struct NotesResponse {
    notes: Vec<Note>,
}

#[derive(Debug, Serialize)]
struct ReplyResponse {
    reply: Reply,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted_count: Option<u64>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    project_name: String,
    total_notes: u64,
    vulnerable: u64,
    not_vulnerable: u64,
    todo: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_updated: Option<DateTime<Utc>>,
}

async fn get_project_notes(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> Result<Json<NotesResponse>, AppError> {
    let notes = state.store.notes_for_project(&project)?;
    Ok(Json(NotesResponse { notes }))
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    path: String,
}

async fn get_file_notes(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Json<NotesResponse>, AppError> {
    let notes = state.store.notes_for_file(&project, &query.path)?;
    Ok(Json(NotesResponse { notes }))
}

#[derive(Debug, Deserialize)]
struct LineQuery {
    path: String,
    line: u32,
}

async fn get_line_notes(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Query(query): Query<LineQuery>,
) -> Result<Json<NotesResponse>, AppError> {
    let notes = state
        .store
        .notes_for_line(&project, &query.path, query.line)?;
    Ok(Json(NotesResponse { notes }))
}

async fn get_note(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NoteResponse>, AppError> {
    let note = state
        .store
        .note_by_id(&NoteId::from(id.as_str()))?
        .ok_or_else(|| AppError::not_found(format!("note {id} does not exist")))?;
    Ok(Json(NoteResponse { note }))
}

async fn create_note(
    State(state): State<AppState>,
    Json(payload): Json<NotePayload>,
) -> Result<Json<NoteResponse>, AppError> {
    payload
        .note
        .validate()
        .map_err(|err| AppError::bad_request(err.to_string()))?;
    let note = state.store.create(&payload.project_name, payload.note)?;
    Ok(Json(NoteResponse { note }))
}

async fn update_note(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<NotePayload>,
) -> Result<Json<NoteResponse>, AppError> {
    payload
        .note
        .validate()
        .map_err(|err| AppError::bad_request(err.to_string()))?;
    let note = state
        .store
        .update(&NoteId::from(id.as_str()), payload.note)?;
    Ok(Json(NoteResponse { note }))
}

async fn delete_note_or_clear(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    let id = NoteId::from(key.as_str());
    if state.store.delete_note(&id)? {
        tracing::info!(note_id = %id, "note deleted");
        return Ok(Json(SuccessResponse {
            success: true,
            deleted_count: None,
        }));
    }
    let deleted = state.store.clear_project(&key)?;
    tracing::info!(project = %key, deleted, "project cleared");
    Ok(Json(SuccessResponse {
        success: true,
        deleted_count: Some(deleted),
    }))
}

async fn create_reply(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(reply): Json<Reply>,
) -> Result<Json<ReplyResponse>, AppError> {
    if reply.comment.trim().is_empty() {
        return Err(AppError::bad_request("reply comment must not be empty"));
    }
    let reply = state.store.add_reply(&NoteId::from(id.as_str()), reply)?;
    Ok(Json(ReplyResponse { reply }))
}

async fn replace_notes(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Json(body): Json<NotesResponse>,
) -> Result<Json<NotesResponse>, AppError> {
    for note in &body.notes {
        note.validate()
            .map_err(|err| AppError::bad_request(err.to_string()))?;
    }
    let notes = state.store.replace_all(&project, body.notes)?;
    Ok(Json(NotesResponse { notes }))
}

async fn get_stats(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> Result<Json<StatsResponse>, AppError> {
    let stats = state.store.stats(&project)?;
    Ok(Json(StatsResponse {
        project_name: project,
        total_notes: stats.total_notes,
        vulnerable: stats.vulnerable,
        not_vulnerable: stats.not_vulnerable,
        todo: stats.todo,
        last_updated: stats.last_updated,
    }))
}
