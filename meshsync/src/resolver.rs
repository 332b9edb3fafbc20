//! Conflict resolution.
//!
//! Resolution is a pure function of the conflict contents, the registered
//! handlers, and the configured default policy. No clock, no randomness:
//! two nodes observing the same pair of changes reach the same verdict, in
//! either arrival order. The policy chain is
//!
//! 1. first matching registered handler (skip or replacement tuple),
//! 2. last-writer-wins by commit timestamp for the four symmetric conflict
//!    classes, ties broken by the lower origin system id,
//! 3. the configured default (apply or skip),
//!
//! and unhandled-abort is terminal.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::change::{Change, Timestamp, Tuple};
use crate::conflict::{ConflictType, DetectedConflict};
use crate::handlers::{ConflictHandler, HandlerVerdict};
use crate::identity::NodeIdentity;

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    TriggerSkip,
    TriggerReturnedTuple,
    LastWriterWinsLocal,
    LastWriterWinsRemote,
    DefaultApply,
    DefaultSkip,
    UnhandledAbort,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resolution::TriggerSkip => "trigger_skip_change",
            Resolution::TriggerReturnedTuple => "trigger_returned_tuple",
            Resolution::LastWriterWinsLocal => "last_writer_wins_keep_local",
            Resolution::LastWriterWinsRemote => "last_writer_wins_keep_remote",
            Resolution::DefaultApply => "default_apply_change",
            Resolution::DefaultSkip => "default_skip_change",
            Resolution::UnhandledAbort => "unhandled_tx_abort",
        })
    }
}

/// Fallback policy when neither a handler nor last-writer-wins decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefaultResolution {
    Apply,
    Skip,
}

/// The resolver's decision: a verdict plus the tuple to write, if any.
///
/// `winning: None` means no write happens: the local state (live row or
/// tombstone) stands as is.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub resolution: Resolution,
    pub winning: Option<Tuple>,
    /// Error detail captured for unhandled-abort verdicts.
    pub error: Option<String>,
}

/// Does the remote side win under last-writer-wins?
///
/// Strictly later commit timestamp wins; on a tie the lower system id wins.
/// Both nodes evaluate mirrored inputs to the same winner, which is what
/// makes resolution order-independent.
fn remote_wins(
    remote_commit: Timestamp,
    remote_origin: &NodeIdentity,
    local_commit: Timestamp,
    local_origin: &NodeIdentity,
) -> bool {
    match remote_commit.cmp(&local_commit) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => remote_origin.sysid < local_origin.sysid,
    }
}

/// The tuple the remote side would write if it wins.
fn remote_winning_tuple(kind: ConflictType, change: &Change) -> Option<Tuple> {
    match kind {
        ConflictType::InsertInsert
        | ConflictType::InsertUpdate
        | ConflictType::UpdateUpdate
        | ConflictType::UpdateDelete => change.new.clone(),
        // The remote side is a delete; winning leaves the key absent.
        ConflictType::DeleteDelete => None,
        ConflictType::UnhandledAbort => None,
    }
}

/// Resolve a detected conflict.
pub fn resolve(
    conflict: &DetectedConflict,
    change: &Change,
    handlers: &[Arc<ConflictHandler>],
    default: DefaultResolution,
) -> Verdict {
    if conflict.kind == ConflictType::UnhandledAbort {
        return Verdict {
            resolution: Resolution::UnhandledAbort,
            winning: None,
            error: None,
        };
    }

    let local_commit = conflict.local_writer.map(|w| w.commit_time);

    // 1. Registered handlers, first match wins.
    for handler in handlers {
        if !handler.matches(conflict.kind, local_commit, change.commit_time) {
            continue;
        }
        match handler.invoke(
            conflict.kind,
            conflict.local_tuple.as_ref(),
            change.new.as_ref(),
        ) {
            Ok(HandlerVerdict::Skip) => {
                return Verdict {
                    resolution: Resolution::TriggerSkip,
                    winning: None,
                    error: None,
                };
            }
            Ok(HandlerVerdict::Replace(tuple)) => {
                return Verdict {
                    resolution: Resolution::TriggerReturnedTuple,
                    winning: Some(tuple),
                    error: None,
                };
            }
            Err(err) => {
                return Verdict {
                    resolution: Resolution::UnhandledAbort,
                    winning: None,
                    error: Some(err.to_string()),
                };
            }
        }
    }

    // 2. Last-writer-wins for the symmetric classes.
    if matches!(
        conflict.kind,
        ConflictType::InsertInsert
            | ConflictType::UpdateUpdate
            | ConflictType::UpdateDelete
            | ConflictType::DeleteDelete
    ) {
        let wins = match conflict.local_writer {
            Some(local) => remote_wins(
                change.commit_time,
                &change.origin,
                local.commit_time,
                &local.origin,
            ),
            // No recorded local writer to defend; the remote side wins.
            None => true,
        };
        return if wins {
            Verdict {
                resolution: Resolution::LastWriterWinsRemote,
                winning: remote_winning_tuple(conflict.kind, change),
                error: None,
            }
        } else {
            Verdict {
                resolution: Resolution::LastWriterWinsLocal,
                winning: None,
                error: None,
            }
        };
    }

    // 3. Default policy (insert-update lands here).
    match default {
        DefaultResolution::Apply => Verdict {
            resolution: Resolution::DefaultApply,
            winning: remote_winning_tuple(conflict.kind, change),
            error: None,
        },
        DefaultResolution::Skip => Verdict {
            resolution: Resolution::DefaultSkip,
            winning: None,
            error: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;
    use crate::handlers::HandlerError;
    use crate::storage::WriterMeta;
    use serde_json::json;

    fn node(sysid: u64) -> NodeIdentity {
        NodeIdentity::new(sysid, 1, 1)
    }

    fn change(kind: ChangeKind, sysid: u64, commit_time: Timestamp) -> Change {
        Change {
            relation: "tasks".into(),
            kind,
            old: None,
            new: Some(Tuple::from([("id", json!(1)), ("v", json!("remote"))])),
            origin: node(sysid),
            remote_txid: 900,
            commit_lsn: 50,
            commit_time,
        }
    }

    fn conflict(kind: ConflictType, local_sysid: u64, local_commit: Timestamp) -> DetectedConflict {
        DetectedConflict {
            kind,
            local_tuple: Some(Tuple::from([("id", json!(1)), ("v", json!("local"))])),
            local_writer: Some(WriterMeta {
                origin: node(local_sysid),
                commit_time: local_commit,
                txid: 10,
            }),
        }
    }

    #[test]
    fn test_later_remote_commit_wins() {
        let verdict = resolve(
            &conflict(ConflictType::InsertInsert, 1, 100),
            &change(ChangeKind::Insert, 2, 105),
            &[],
            DefaultResolution::Apply,
        );
        assert_eq!(verdict.resolution, Resolution::LastWriterWinsRemote);
        assert_eq!(
            verdict.winning.unwrap().get("v"),
            Some(&json!("remote"))
        );
    }

    #[test]
    fn test_later_local_commit_wins() {
        let verdict = resolve(
            &conflict(ConflictType::UpdateUpdate, 1, 200),
            &change(ChangeKind::Update, 2, 150),
            &[],
            DefaultResolution::Apply,
        );
        assert_eq!(verdict.resolution, Resolution::LastWriterWinsLocal);
        assert!(verdict.winning.is_none());
    }

    #[test]
    fn test_tie_breaks_to_lower_sysid() {
        // Same commit time: origin with sysid 1 beats sysid 2, whichever
        // side it is on.
        let remote_low = resolve(
            &conflict(ConflictType::UpdateUpdate, 2, 100),
            &change(ChangeKind::Update, 1, 100),
            &[],
            DefaultResolution::Apply,
        );
        assert_eq!(remote_low.resolution, Resolution::LastWriterWinsRemote);

        let remote_high = resolve(
            &conflict(ConflictType::UpdateUpdate, 1, 100),
            &change(ChangeKind::Update, 2, 100),
            &[],
            DefaultResolution::Apply,
        );
        assert_eq!(remote_high.resolution, Resolution::LastWriterWinsLocal);
    }

    #[test]
    fn test_resolution_is_order_independent() {
        // Node X sees A local, B remote; node Y sees B local, A remote.
        // Both must pick the same winner (B, committed later).
        let on_x = resolve(
            &conflict(ConflictType::UpdateUpdate, 1, 100),
            &change(ChangeKind::Update, 2, 105),
            &[],
            DefaultResolution::Apply,
        );
        let on_y = resolve(
            &conflict(ConflictType::UpdateUpdate, 2, 105),
            &change(ChangeKind::Update, 1, 100),
            &[],
            DefaultResolution::Apply,
        );
        assert_eq!(on_x.resolution, Resolution::LastWriterWinsRemote);
        assert_eq!(on_y.resolution, Resolution::LastWriterWinsLocal);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let c = conflict(ConflictType::InsertInsert, 1, 100);
        let ch = change(ChangeKind::Insert, 2, 105);
        let first = resolve(&c, &ch, &[], DefaultResolution::Apply);
        let second = resolve(&c, &ch, &[], DefaultResolution::Apply);
        assert_eq!(first.resolution, second.resolution);
        assert_eq!(first.winning, second.winning);
    }

    #[test]
    fn test_update_delete_remote_update_loses_to_newer_delete() {
        // Scenario: delete at t=200 (local), update at t=195 (remote).
        let verdict = resolve(
            &DetectedConflict {
                kind: ConflictType::UpdateDelete,
                local_tuple: None,
                local_writer: Some(WriterMeta {
                    origin: node(1),
                    commit_time: 200,
                    txid: 10,
                }),
            },
            &change(ChangeKind::Update, 2, 195),
            &[],
            DefaultResolution::Apply,
        );
        assert_eq!(verdict.resolution, Resolution::LastWriterWinsLocal);
        assert!(verdict.winning.is_none());
    }

    #[test]
    fn test_insert_update_falls_through_to_default() {
        let c = DetectedConflict {
            kind: ConflictType::InsertUpdate,
            local_tuple: None,
            local_writer: Some(WriterMeta {
                origin: node(1),
                commit_time: 100,
                txid: 10,
            }),
        };
        let ch = change(ChangeKind::Update, 2, 300);

        let applied = resolve(&c, &ch, &[], DefaultResolution::Apply);
        assert_eq!(applied.resolution, Resolution::DefaultApply);
        assert!(applied.winning.is_some());

        let skipped = resolve(&c, &ch, &[], DefaultResolution::Skip);
        assert_eq!(skipped.resolution, Resolution::DefaultSkip);
        assert!(skipped.winning.is_none());
    }

    #[test]
    fn test_handler_skip_preempts_lww() {
        let handler = Arc::new(ConflictHandler::new(
            "always-skip",
            ConflictType::InsertInsert,
            None,
            |_, _, _| Ok(HandlerVerdict::Skip),
        ));
        let verdict = resolve(
            &conflict(ConflictType::InsertInsert, 1, 100),
            &change(ChangeKind::Insert, 2, 105),
            &[handler],
            DefaultResolution::Apply,
        );
        assert_eq!(verdict.resolution, Resolution::TriggerSkip);
    }

    #[test]
    fn test_handler_replacement_tuple_is_used() {
        let handler = Arc::new(ConflictHandler::new(
            "merge",
            ConflictType::UpdateUpdate,
            None,
            |_, _, _| {
                Ok(HandlerVerdict::Replace(Tuple::from([
                    ("id", json!(1)),
                    ("v", json!("merged")),
                ])))
            },
        ));
        let verdict = resolve(
            &conflict(ConflictType::UpdateUpdate, 1, 100),
            &change(ChangeKind::Update, 2, 105),
            &[handler],
            DefaultResolution::Apply,
        );
        assert_eq!(verdict.resolution, Resolution::TriggerReturnedTuple);
        assert_eq!(
            verdict.winning.unwrap().get("v"),
            Some(&json!("merged"))
        );
    }

    #[test]
    fn test_handler_outside_timeframe_is_ignored() {
        let handler = Arc::new(ConflictHandler::new(
            "narrow",
            ConflictType::UpdateUpdate,
            Some(2),
            |_, _, _| Ok(HandlerVerdict::Skip),
        ));
        let verdict = resolve(
            &conflict(ConflictType::UpdateUpdate, 1, 100),
            &change(ChangeKind::Update, 2, 105),
            &[handler],
            DefaultResolution::Apply,
        );
        // Commits are 5 apart, window is 2: falls through to LWW.
        assert_eq!(verdict.resolution, Resolution::LastWriterWinsRemote);
    }

    #[test]
    fn test_handler_failure_becomes_unhandled_abort() {
        let handler = Arc::new(ConflictHandler::new(
            "broken",
            ConflictType::UpdateUpdate,
            None,
            |_, _, _| Err(HandlerError("lookup oid 0 failed".into())),
        ));
        let verdict = resolve(
            &conflict(ConflictType::UpdateUpdate, 1, 100),
            &change(ChangeKind::Update, 2, 105),
            &[handler],
            DefaultResolution::Apply,
        );
        assert_eq!(verdict.resolution, Resolution::UnhandledAbort);
        assert!(verdict.error.unwrap().contains("lookup oid 0 failed"));
    }
}
