//! Scenario tests against the public engine surface.

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use tack_core::backend::RelationalBackend;
use tack_core::conflict::ResolutionPolicy;
use tack_core::migrate::MigrationEngine;
use tack_core::models::{NoteState, Severity};
use tack_core::{create_backend, EngineConfig, Note, NoteBackend};

fn local_config(dir: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::local("demo", "alice");
    config.notes_dir = Some(dir.to_string_lossy().to_string());
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_update_cycle_through_factory() {
    let dir = tempdir().unwrap();
    let mut backend = create_backend(&local_config(dir.path())).unwrap();
    backend.setup().await.unwrap();

    let mut note = Note::new(
        "src/login.py",
        12,
        "alice",
        "session token logged in plaintext",
        NoteState::Vulnerable,
    )
    .with_severity(Severity::Medium);
    backend.save(&mut note).await.unwrap();
    let id = note.id.clone().expect("backend assigned an id");
    assert_eq!(note.version, 1);

    note.state = NoteState::NotVulnerable;
    note.severity = None;
    note.comment = "token is redacted by the log filter".to_string();
    backend.save(&mut note).await.unwrap();
    assert_eq!(note.version, 2);
    assert!(note.updated_at.is_some());

    // A fresh instance over the same directory sees the durable state
    let mut reopened = create_backend(&local_config(dir.path())).unwrap();
    reopened.setup().await.unwrap();
    let fetched = reopened.get(&id).await.unwrap().unwrap();
    assert_eq!(fetched.version, 2);
    assert_eq!(fetched.state, NoteState::NotVulnerable);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_migrate_local_project_into_database() {
    let dir = tempdir().unwrap();
    let mut source = create_backend(&local_config(dir.path())).unwrap();
    source.setup().await.unwrap();

    for (path, line, comment) in [
        ("src/a.py", 3, "command built from request args"),
        ("src/b.py", 9, "tls verification disabled"),
    ] {
        let mut note = Note::new(path, line, "alice", comment, NoteState::Vulnerable)
            .with_severity(Severity::High);
        source.save(&mut note).await.unwrap();
    }

    let mut target = RelationalBackend::in_memory("demo", "alice");
    target.setup().await.unwrap();

    let report = MigrationEngine::new(source.as_mut(), &mut target)
        .bidirectional(ResolutionPolicy::NewestWins, |_| {})
        .await
        .unwrap();
    assert!(report.success());
    assert_eq!(report.migrated, 2);

    let stats = target.stats().await.unwrap();
    assert_eq!(stats.total_notes, 2);
    assert_eq!(stats.vulnerable, 2);
}
