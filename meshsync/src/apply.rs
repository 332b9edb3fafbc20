//! Apply-side integration.
//!
//! One [`ApplyWorker`] exists per remote origin. For every decoded change it
//! takes the key lock, classifies against local state, resolves any
//! conflict, performs the winning write, and records the conflict, all
//! while holding the lock, so a concurrent apply worker can never observe a
//! half-resolved row.
//!
//! Changes from one origin arrive in commit order (guaranteed upstream);
//! across origins there is no order at all, which is exactly why
//! classification and resolution are deterministic and order-independent.
//! Re-delivering an already-applied change is a no-op, so a connection
//! retried from its last durable position is safe.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::change::{Change, ChangeKind};
use crate::conflict::{ApplyAction, ConflictOutcome, ConflictType, DetectedConflict, classify};
use crate::conflict_log::{ConflictLog, ConflictRecord, SinkError, now_micros};
use crate::handlers::HandlerRegistry;
use crate::identity::NodeIdentity;
use crate::registry::RelationRegistry;
use crate::resolver::{DefaultResolution, Resolution, Verdict, resolve};
use crate::storage::{KeyLock, StoreError, TupleStore, WriterMeta};
use crate::workers::WorkerRegistry;

/// What the caller should take away from one apply call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyVerdict {
    /// The change (or a resolved replacement) was written.
    Applied,
    /// The change was skipped; local state stands.
    Skipped,
    /// The worker's stop position lies before this change; it was not
    /// started. The caller should wind the worker down.
    Stopped,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    /// The relation is not registered; fatal to this apply process.
    #[error("relation {0} is not registered for replication")]
    UnknownRelation(String),
    /// The change carries no image for the replica-identity key.
    #[error("change for {0} carries no replica-identity key image")]
    MissingKeyImage(String),
    /// A key column is absent from the image; the key is malformed.
    #[error("malformed replica-identity key for {0}")]
    MalformedKey(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// Unhandled-abort: recorded, then re-raised so the transaction aborts
    /// and the connection retries it.
    #[error("unhandled conflict, apply aborted: {detail}")]
    Unhandled { record_id: Uuid, detail: String },
}

/// Applies one origin's change stream against the local store.
pub struct ApplyWorker {
    origin: NodeIdentity,
    store: Arc<dyn TupleStore>,
    relations: Arc<RelationRegistry>,
    handlers: Arc<HandlerRegistry>,
    log: Arc<ConflictLog>,
    workers: Arc<WorkerRegistry>,
    default_resolution: DefaultResolution,
}

impl ApplyWorker {
    pub(crate) fn new(
        origin: NodeIdentity,
        store: Arc<dyn TupleStore>,
        relations: Arc<RelationRegistry>,
        handlers: Arc<HandlerRegistry>,
        log: Arc<ConflictLog>,
        workers: Arc<WorkerRegistry>,
        default_resolution: DefaultResolution,
    ) -> Self {
        Self {
            origin,
            store,
            relations,
            handlers,
            log,
            workers,
            default_resolution,
        }
    }

    /// The remote origin this worker serves.
    pub fn origin(&self) -> NodeIdentity {
        self.origin
    }

    /// Apply one decoded change.
    pub async fn apply(&self, change: &Change) -> Result<ApplyVerdict, ApplyError> {
        if let Some(stop) = self.workers.stop_position(self.origin) {
            if change.commit_lsn > stop {
                log::info!(
                    "apply worker for {} reached stop position {stop}, skipping lsn {}",
                    self.origin,
                    change.commit_lsn,
                );
                return Ok(ApplyVerdict::Stopped);
            }
        }
        self.workers.wait_if_paused().await;

        let meta = self
            .relations
            .get(&change.relation)
            .ok_or_else(|| ApplyError::UnknownRelation(change.relation.clone()))?;
        let key_image = change
            .key_image()
            .ok_or_else(|| ApplyError::MissingKeyImage(change.relation.clone()))?;
        let key = key_image
            .project_key(&meta.key_columns)
            .ok_or_else(|| ApplyError::MalformedKey(change.relation.clone()))?;

        // Held across classify + resolve + apply.
        let lock = self.store.lock_key(&change.relation, &key).await?;
        let local = self.store.read(&lock).await?;

        let verdict = match classify(change, &local) {
            ConflictOutcome::NoConflict(action) => {
                self.perform_action(&lock, change, action).await?
            }
            ConflictOutcome::Conflict(conflict) => {
                self.resolve_and_apply(&lock, change, conflict).await?
            }
        };
        if verdict == ApplyVerdict::Applied {
            self.log.stats().note_apply(change.kind);
        }
        self.workers.note_applied(self.origin, change.commit_lsn);
        Ok(verdict)
    }

    fn writer_meta(&self, change: &Change) -> WriterMeta {
        WriterMeta {
            origin: change.origin,
            commit_time: change.commit_time,
            txid: change.remote_txid,
        }
    }

    async fn perform_action(
        &self,
        lock: &KeyLock,
        change: &Change,
        action: ApplyAction,
    ) -> Result<ApplyVerdict, ApplyError> {
        let writer = self.writer_meta(change);
        let result = match action {
            ApplyAction::InsertRow | ApplyAction::UpdateRow | ApplyAction::InsertFromUpdate => {
                match &change.new {
                    Some(tuple) => self.store.put(lock, tuple.clone(), writer).await,
                    None => return Err(ApplyError::MissingKeyImage(change.relation.clone())),
                }
            }
            ApplyAction::DeleteRow => self.store.delete(lock, writer).await,
            ApplyAction::Noop => return Ok(ApplyVerdict::Skipped),
        };
        match result {
            Ok(()) => Ok(ApplyVerdict::Applied),
            // The write itself failed: not classifiable as a row conflict,
            // so it becomes an unhandled-abort, recorded before re-raising.
            Err(e) => self.unhandled_abort(lock, change, None, e.to_string()).await,
        }
    }

    async fn resolve_and_apply(
        &self,
        lock: &KeyLock,
        change: &Change,
        conflict: DetectedConflict,
    ) -> Result<ApplyVerdict, ApplyError> {
        let handlers = self.handlers.lookup(&change.relation);
        let verdict = resolve(&conflict, change, &handlers, self.default_resolution);

        let record = self.build_record(lock, change, &conflict, &verdict);
        let record_id = record.id;
        self.log.record(&record).await?;

        if verdict.resolution == Resolution::UnhandledAbort {
            return Err(ApplyError::Unhandled {
                record_id,
                detail: verdict.error.unwrap_or_else(|| "handler failed".into()),
            });
        }

        match verdict.winning {
            Some(tuple) => {
                let write = self
                    .store
                    .put(lock, tuple, self.writer_meta(change))
                    .await;
                match write {
                    Ok(()) => Ok(ApplyVerdict::Applied),
                    Err(e) => {
                        self.unhandled_abort(lock, change, Some(&conflict), e.to_string())
                            .await
                    }
                }
            }
            None => {
                // No write: the local side (row or tombstone) stands. The
                // one exception is a winning remote delete against a live
                // row, which never reaches here because it classifies as a
                // plain delete.
                Ok(ApplyVerdict::Skipped)
            }
        }
    }

    /// Record an unclassifiable apply failure and re-raise it.
    async fn unhandled_abort(
        &self,
        lock: &KeyLock,
        change: &Change,
        conflict: Option<&DetectedConflict>,
        detail: String,
    ) -> Result<ApplyVerdict, ApplyError> {
        let synthetic = DetectedConflict {
            kind: ConflictType::UnhandledAbort,
            local_tuple: conflict.and_then(|c| c.local_tuple.clone()),
            local_writer: conflict.and_then(|c| c.local_writer),
        };
        let verdict = Verdict {
            resolution: Resolution::UnhandledAbort,
            winning: None,
            error: Some(detail.clone()),
        };
        let record = self.build_record(lock, change, &synthetic, &verdict);
        let record_id = record.id;
        self.log.record(&record).await?;
        Err(ApplyError::Unhandled { record_id, detail })
    }

    fn build_record(
        &self,
        lock: &KeyLock,
        change: &Change,
        conflict: &DetectedConflict,
        verdict: &Verdict,
    ) -> ConflictRecord {
        ConflictRecord {
            id: Uuid::new_v4(),
            relation: change.relation.clone(),
            key: lock.key().to_string(),
            kind: conflict.kind,
            resolution: verdict.resolution,
            local_origin: conflict.local_writer.map(|w| w.origin),
            local_commit_time: conflict.local_writer.map(|w| w.commit_time),
            local_txid: conflict.local_writer.map(|w| w.txid),
            local_tuple: conflict.local_tuple.clone(),
            remote_origin: change.origin,
            remote_commit_time: change.commit_time,
            remote_commit_lsn: change.commit_lsn,
            remote_txid: change.remote_txid,
            remote_tuple: match change.kind {
                ChangeKind::Delete => change.old.clone(),
                _ => change.new.clone(),
            },
            detected_at: now_micros(),
            error: verdict.error.clone(),
        }
    }
}
