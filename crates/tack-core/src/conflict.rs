//! Conflict detection and resolution.
//!
//! The unit of resolution is the whole note: a policy picks one complete
//! version as the winner, it never merges field-by-field. The narrower
//! operational-transform helper exists for the "two concurrent updates to
//! distinct optional fields" case and still refuses to merge a diverged
//! `comment` silently.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::{ChangeAction, ChangeRecord, Note, NoteId};

/// How overlapping edits to the same note are settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolutionPolicy {
    LocalWins,
    RemoteWins,
    #[default]
    NewestWins,
    /// Defer to an external decision-maker
    Ask,
}

/// A detected divergence on one note
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub note_id: NoteId,
    /// The locally cached version, if any
    pub local: Option<Note>,
    /// The incoming remote change
    pub remote: ChangeRecord,
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Apply this whole note as the winner
    Take(Note),
    /// The incoming change wins and the note is removed
    Delete(NoteId),
    /// Leave everything as it is
    Skip,
}

/// External decision-maker for [`ResolutionPolicy::Ask`]
#[async_trait]
pub trait ConflictArbiter: Send {
    async fn decide(&mut self, conflict: &Conflict) -> Resolution;
}

/// Result of sifting a change batch: direct applies and raised conflicts
#[derive(Debug, Default)]
pub struct DetectionOutcome {
    pub apply: Vec<ChangeRecord>,
    pub conflicts: Vec<Conflict>,
}

/// Group incoming changes by note id and separate clean applies from
/// conflicts. A conflict is raised when more than one record targets the
/// same id, or when the local copy is strictly newer than the incoming
/// change.
#[must_use]
pub fn detect(records: Vec<ChangeRecord>, local: &HashMap<NoteId, Note>) -> DetectionOutcome {
    let mut grouped: HashMap<NoteId, Vec<ChangeRecord>> = HashMap::new();
    let mut order: Vec<NoteId> = Vec::new();
    for record in records {
        let entry = grouped.entry(record.note_id.clone()).or_default();
        if entry.is_empty() {
            order.push(record.note_id.clone());
        }
        entry.push(record);
    }

    let mut outcome = DetectionOutcome::default();
    for id in order {
        let mut group = grouped.remove(&id).unwrap_or_default();
        let local_note = local.get(&id);

        if group.len() > 1 {
            // Concurrent remote edits: keep the dominant one as the
            // incoming side and flag the group as a conflict
            group.sort_by(compare_records);
            let dominant = group.pop().unwrap_or_else(|| unreachable!());
            outcome.conflicts.push(Conflict {
                note_id: id,
                local: local_note.cloned(),
                remote: dominant,
            });
            continue;
        }

        let record = group.remove(0);
        let locally_newer = local_note
            .is_some_and(|note| note.effective_timestamp() > record.effective_timestamp());
        if locally_newer {
            outcome.conflicts.push(Conflict {
                note_id: id,
                local: local_note.cloned(),
                remote: record,
            });
        } else {
            outcome.apply.push(record);
        }
    }
    outcome
}

/// Deterministic ordering for `newest_wins`: effective timestamp, then
/// session id, then note id. Input order never matters.
fn compare_records(a: &ChangeRecord, b: &ChangeRecord) -> std::cmp::Ordering {
    a.effective_timestamp()
        .cmp(&b.effective_timestamp())
        .then_with(|| a.session_id.cmp(&b.session_id))
        .then_with(|| a.note_id.cmp(&b.note_id))
}

/// Resolve one conflict under a policy. `Ask` must go through
/// [`resolve_with`]; calling it here is an error rather than a silent
/// default.
pub fn resolve(conflict: &Conflict, policy: ResolutionPolicy) -> Result<Resolution> {
    match policy {
        ResolutionPolicy::LocalWins => Ok(conflict
            .local
            .clone()
            .map_or(Resolution::Skip, Resolution::Take)),
        ResolutionPolicy::RemoteWins => Ok(remote_resolution(conflict)),
        ResolutionPolicy::NewestWins => {
            let Some(local) = &conflict.local else {
                return Ok(remote_resolution(conflict));
            };
            let local_ts = local.effective_timestamp();
            let remote_ts = conflict.remote.effective_timestamp();
            if local_ts > remote_ts {
                return Ok(Resolution::Take(local.clone()));
            }
            if remote_ts > local_ts {
                return Ok(remote_resolution(conflict));
            }
            // Exact timestamp tie: order on note content so both sides of
            // a sync settle on the same winner regardless of which one is
            // "local"
            match &conflict.remote.note {
                None => Ok(remote_resolution(conflict)),
                Some(remote_note) => {
                    let remote_key =
                        (remote_note.version, &remote_note.author, &remote_note.comment);
                    let local_key = (local.version, &local.author, &local.comment);
                    if remote_key >= local_key {
                        Ok(Resolution::Take(remote_note.clone()))
                    } else {
                        Ok(Resolution::Take(local.clone()))
                    }
                }
            }
        }
        ResolutionPolicy::Ask => Err(Error::Conflict(format!(
            "conflict on {} requires an arbiter",
            conflict.note_id
        ))),
    }
}

/// Resolve with an arbiter available for the `Ask` policy.
pub async fn resolve_with(
    conflict: &Conflict,
    policy: ResolutionPolicy,
    arbiter: &mut dyn ConflictArbiter,
) -> Result<Resolution> {
    if policy == ResolutionPolicy::Ask {
        return Ok(arbiter.decide(conflict).await);
    }
    resolve(conflict, policy)
}

fn remote_resolution(conflict: &Conflict) -> Resolution {
    match conflict.remote.action {
        ChangeAction::Delete => Resolution::Delete(conflict.note_id.clone()),
        ChangeAction::Create | ChangeAction::Update => conflict
            .remote
            .note
            .clone()
            .map_or(Resolution::Skip, Resolution::Take),
    }
}

/// Operational-transform variant for concurrent updates touching distinct
/// fields: optional fields the winner left empty are preserved from the
/// loser. Returns the merged note and whether the `comment` field actually
/// diverged and needs user attention.
#[must_use]
pub fn merge_fields(winner: &Note, loser: &Note) -> (Note, bool) {
    let mut merged = winner.clone();
    if merged.description.is_none() {
        merged.description.clone_from(&loser.description);
    }
    if merged.cwe.is_none() {
        merged.cwe.clone_from(&loser.cwe);
    }
    if merged.severity.is_none() {
        merged.severity = loser.severity;
    }
    if merged.import_metadata.is_none() {
        merged.import_metadata.clone_from(&loser.import_metadata);
    }
    let comment_diverged = winner.comment != loser.comment;
    (merged, comment_diverged)
}
