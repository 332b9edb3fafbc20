//! Conflict classification.
//!
//! When a remote change arrives, we compare it against the current local
//! state for the same replica-identity key. The result is either a plain
//! apply action or a detected conflict in one of six classes, which the
//! resolver then decides. Classification is a pure function of
//! `(change, local state)`: given identical inputs, every node classifies
//! identically, regardless of the order changes arrived in.
//!
//! Self-conflicts are suppressed through origin tracking: a change from the
//! same origin that last wrote the local row is an in-order successor, not a
//! conflict, and a duplicate delivery of an already-applied change is a
//! no-op.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::change::{Change, ChangeKind, Tuple};
use crate::storage::{LocalState, WriterMeta};

/// Class of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictType {
    /// Remote insert found a live local row for the key.
    InsertInsert,
    /// Remote update found the key deleted by an older local commit; the
    /// update supersedes the stale delete and re-applies as an insert.
    InsertUpdate,
    /// Remote update found a live row last written by a different origin.
    UpdateUpdate,
    /// Remote update found the key deleted by a newer-or-equal local commit.
    UpdateDelete,
    /// Remote delete found the key already gone.
    DeleteDelete,
    /// Apply-time failure not classifiable above (constraint violation,
    /// coercion failure); terminal, the transaction aborts.
    UnhandledAbort,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictType::InsertInsert => "insert_insert",
            ConflictType::InsertUpdate => "insert_update",
            ConflictType::UpdateUpdate => "update_update",
            ConflictType::UpdateDelete => "update_delete",
            ConflictType::DeleteDelete => "delete_delete",
            ConflictType::UnhandledAbort => "unhandled_tx_abort",
        })
    }
}

/// What to do when no conflict was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    InsertRow,
    UpdateRow,
    /// Remote update for a key we never saw: apply the new values as an
    /// insert.
    InsertFromUpdate,
    DeleteRow,
    /// Duplicate or stale delivery from the same origin; nothing to do.
    Noop,
}

/// A detected conflict, carrying the local side's state at detection time.
#[derive(Debug, Clone)]
pub struct DetectedConflict {
    pub kind: ConflictType,
    /// Live local tuple, when one exists.
    pub local_tuple: Option<Tuple>,
    /// Last writer of the local row or tombstone, when known.
    pub local_writer: Option<WriterMeta>,
}

/// Outcome of classifying one change against local state.
#[derive(Debug, Clone)]
pub enum ConflictOutcome {
    NoConflict(ApplyAction),
    Conflict(DetectedConflict),
}

fn conflict(
    kind: ConflictType,
    local_tuple: Option<Tuple>,
    local_writer: Option<WriterMeta>,
) -> ConflictOutcome {
    ConflictOutcome::Conflict(DetectedConflict {
        kind,
        local_tuple,
        local_writer,
    })
}

/// Classify a remote change against the key's current local state.
///
/// The caller must hold the key lock and keep holding it through resolution
/// and apply.
pub fn classify(change: &Change, local: &LocalState) -> ConflictOutcome {
    match change.kind {
        ChangeKind::Insert => match &local.row {
            Some(row)
                if row.writer.origin == change.origin
                    && row.writer.commit_time == change.commit_time =>
            {
                // The row already reflects this exact commit.
                ConflictOutcome::NoConflict(ApplyAction::Noop)
            }
            Some(row) => conflict(
                ConflictType::InsertInsert,
                Some(row.tuple.clone()),
                Some(row.writer),
            ),
            None => ConflictOutcome::NoConflict(ApplyAction::InsertRow),
        },

        ChangeKind::Update => match &local.row {
            Some(row) if row.writer.origin == change.origin => {
                if row.writer.commit_time >= change.commit_time {
                    // Duplicate or stale delivery; per-origin commit order
                    // means we already hold a newer-or-equal version.
                    ConflictOutcome::NoConflict(ApplyAction::Noop)
                } else {
                    // In-order successor from the origin that wrote the row.
                    ConflictOutcome::NoConflict(ApplyAction::UpdateRow)
                }
            }
            Some(row) => conflict(
                ConflictType::UpdateUpdate,
                Some(row.tuple.clone()),
                Some(row.writer),
            ),
            None => match &local.tombstone {
                Some(t) if t.writer.commit_time >= change.commit_time => {
                    conflict(ConflictType::UpdateDelete, None, Some(t.writer))
                }
                Some(t) => conflict(ConflictType::InsertUpdate, None, Some(t.writer)),
                None => ConflictOutcome::NoConflict(ApplyAction::InsertFromUpdate),
            },
        },

        ChangeKind::Delete => match &local.row {
            Some(_) => ConflictOutcome::NoConflict(ApplyAction::DeleteRow),
            None => match &local.tombstone {
                Some(t)
                    if t.writer.origin == change.origin
                        && t.writer.commit_time == change.commit_time =>
                {
                    // Matching tombstone metadata: this very delete already
                    // applied here.
                    ConflictOutcome::NoConflict(ApplyAction::Noop)
                }
                other => conflict(
                    ConflictType::DeleteDelete,
                    None,
                    other.as_ref().map(|t| t.writer),
                ),
            },
        },
    }
}
