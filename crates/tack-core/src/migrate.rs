//! Bulk migration of the full note set between two backends.
//!
//! Operates on two already-initialized backend instances and never touches
//! global configuration. Item failures are collected, never fatal: the
//! batch always runs to completion and overall success means zero errors.

use std::collections::HashMap;

use crate::backend::NoteBackend;
use crate::conflict::{resolve, Conflict, Resolution, ResolutionPolicy};
use crate::error::{Error, Result};
use crate::models::{ChangeAction, ChangeRecord, Note, NoteId};

/// Fired before each migrated item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationProgress {
    pub index: usize,
    pub total: usize,
    /// Human-readable item label, `file:line`
    pub label: String,
}

/// Outcome of a migration run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub errors: Vec<String>,
}

impl MigrationReport {
    #[must_use]
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Write-free preview of what a migration would do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Notes present only on the source side
    pub to_target: usize,
    /// Notes present only on the target side (bidirectional only)
    pub to_source: usize,
    /// Ids present on both sides with differing content
    pub conflicts: usize,
}

pub struct MigrationEngine<'a> {
    source: &'a mut (dyn NoteBackend + Send),
    target: &'a mut (dyn NoteBackend + Send),
}

impl<'a> MigrationEngine<'a> {
    pub fn new(
        source: &'a mut (dyn NoteBackend + Send),
        target: &'a mut (dyn NoteBackend + Send),
    ) -> Self {
        Self { source, target }
    }

    /// Validate preconditions before any write begins. Failure here means
    /// zero side effects anywhere.
    pub async fn validate(&mut self) -> Result<()> {
        if !self.source.is_connected().await {
            return Err(Error::Connectivity(
                "migration source backend is not reachable".into(),
            ));
        }
        if !self.target.is_connected().await {
            return Err(Error::Connectivity(
                "migration target backend is not reachable".into(),
            ));
        }
        Ok(())
    }

    /// One-way copy: every source note is inserted/updated into the target.
    pub async fn copy(
        &mut self,
        mut progress: impl FnMut(&MigrationProgress) + Send,
    ) -> Result<MigrationReport> {
        self.validate().await?;
        self.source.load_all().await?;
        let notes = self.source.get_all().await?;
        let total = notes.len();
        let mut report = MigrationReport::default();

        for (index, note) in notes.into_iter().enumerate() {
            progress(&MigrationProgress {
                index,
                total,
                label: format!("{}:{}", note.file_path, note.line_number),
            });
            let mut copy = note;
            match self.target.save(&mut copy).await {
                Ok(()) => report.migrated += 1,
                Err(err) => {
                    tracing::warn!(label = ?copy.id, %err, "migration item failed");
                    report.errors.push(format!(
                        "{}:{}: {err}",
                        copy.file_path, copy.line_number
                    ));
                }
            }
        }
        Ok(report)
    }

    /// Bidirectional sync: one-sided notes are copied over, overlapping ids
    /// go through the conflict resolver and the winner lands on whichever
    /// side did not already hold it.
    pub async fn bidirectional(
        &mut self,
        policy: ResolutionPolicy,
        mut progress: impl FnMut(&MigrationProgress) + Send,
    ) -> Result<MigrationReport> {
        self.validate().await?;
        self.source.load_all().await?;
        self.target.load_all().await?;
        let source_notes = index_by_id(self.source.get_all().await?);
        let target_notes = index_by_id(self.target.get_all().await?);

        let mut ids: Vec<NoteId> = source_notes
            .keys()
            .chain(target_notes.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();

        let total = ids.len();
        let mut report = MigrationReport::default();

        for (index, id) in ids.into_iter().enumerate() {
            let in_source = source_notes.get(&id);
            let in_target = target_notes.get(&id);
            let label = in_source
                .or(in_target)
                .map_or_else(String::new, |note| {
                    format!("{}:{}", note.file_path, note.line_number)
                });
            progress(&MigrationProgress { index, total, label });

            match (in_source, in_target) {
                (Some(note), None) => {
                    write_item(self.target, note, &mut report).await;
                }
                (None, Some(note)) => {
                    write_item(self.source, note, &mut report).await;
                }
                (Some(ours), Some(theirs)) => {
                    if ours == theirs {
                        report.skipped += 1;
                        continue;
                    }
                    report.conflicts += 1;
                    match resolve(&overlap_conflict(&id, ours, theirs), policy) {
                        Ok(Resolution::Take(winner)) => {
                            if &winner != ours {
                                write_item(self.source, &winner, &mut report).await;
                            }
                            if &winner != theirs {
                                write_item(self.target, &winner, &mut report).await;
                            }
                        }
                        Ok(Resolution::Delete(id)) => {
                            let ours = self.source.delete(&id).await;
                            let theirs = self.target.delete(&id).await;
                            let ok = record_delete_outcome(&id, ours, &mut report)
                                & record_delete_outcome(&id, theirs, &mut report);
                            if ok {
                                report.migrated += 1;
                            }
                        }
                        Ok(Resolution::Skip) => report.skipped += 1,
                        Err(err) => report.errors.push(format!("{id}: {err}")),
                    }
                }
                (None, None) => {}
            }
        }
        Ok(report)
    }

    /// Compute the bidirectional diff without issuing any writes.
    pub async fn dry_run(&mut self) -> Result<MigrationPlan> {
        self.validate().await?;
        self.source.load_all().await?;
        self.target.load_all().await?;
        let source_notes = index_by_id(self.source.get_all().await?);
        let target_notes = index_by_id(self.target.get_all().await?);

        let mut plan = MigrationPlan::default();
        for (id, note) in &source_notes {
            match target_notes.get(id) {
                None => plan.to_target += 1,
                Some(theirs) if theirs != note => plan.conflicts += 1,
                Some(_) => {}
            }
        }
        plan.to_source = target_notes
            .keys()
            .filter(|id| !source_notes.contains_key(*id))
            .count();
        Ok(plan)
    }
}

fn index_by_id(notes: Vec<Note>) -> HashMap<NoteId, Note> {
    notes
        .into_iter()
        .filter_map(|note| note.id.clone().map(|id| (id, note)))
        .collect()
}

/// Frame an overlapping pair as a conflict for the shared resolver, with
/// the target's copy playing the incoming side.
fn overlap_conflict(id: &NoteId, ours: &Note, theirs: &Note) -> Conflict {
    Conflict {
        note_id: id.clone(),
        local: Some(ours.clone()),
        remote: ChangeRecord {
            action: ChangeAction::Update,
            note_id: id.clone(),
            note: Some(theirs.clone()),
            author: theirs.author.clone(),
            timestamp: theirs.effective_timestamp(),
            session_id: String::new(),
        },
    }
}

/// A delete landing on a side that never held the note still counts as
/// done; anything else is recorded like a failed save.
fn record_delete_outcome(id: &NoteId, outcome: Result<()>, report: &mut MigrationReport) -> bool {
    match outcome {
        Ok(()) | Err(Error::NotFound(_)) => true,
        Err(err) => {
            tracing::warn!(%id, %err, "migration delete failed");
            report.errors.push(format!("{id}: {err}"));
            false
        }
    }
}

async fn write_item(
    backend: &mut (dyn NoteBackend + Send),
    note: &Note,
    report: &mut MigrationReport,
) {
    let mut copy = note.clone();
    match backend.save(&mut copy).await {
        Ok(()) => report.migrated += 1,
        Err(err) => report.errors.push(format!(
            "{}:{}: {err}",
            copy.file_path, copy.line_number
        )),
    }
}
