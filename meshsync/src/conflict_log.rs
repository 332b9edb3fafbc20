//! Conflict logging.
//!
//! Every detected conflict produces exactly one [`ConflictRecord`],
//! regardless of how it resolved. Records go to two sinks: a structured log
//! line (always) and a durable table behind [`ConflictSink`] when the
//! operator enabled table logging. Losing conflict visibility is not
//! acceptable, so a sink failure propagates as a fatal error instead of
//! being swallowed.
//!
//! The log also keeps the per-type conflict counters and apply counters
//! exposed to operators.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::change::{ChangeKind, Lsn, Timestamp, Tuple, TxId};
use crate::conflict::ConflictType;
use crate::identity::NodeIdentity;
use crate::resolver::Resolution;

/// One detected conflict, written once and never mutated.
///
/// The resolution is always set before the record reaches a sink; there is
/// no "undetermined" terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub relation: String,
    /// Canonical replica-identity key of the contended row.
    pub key: String,
    pub kind: ConflictType,
    pub resolution: Resolution,

    pub local_origin: Option<NodeIdentity>,
    pub local_commit_time: Option<Timestamp>,
    pub local_txid: Option<TxId>,
    pub local_tuple: Option<Tuple>,

    pub remote_origin: NodeIdentity,
    pub remote_commit_time: Timestamp,
    pub remote_commit_lsn: Lsn,
    pub remote_txid: TxId,
    pub remote_tuple: Option<Tuple>,

    /// Wall-clock detection time in microseconds. Observability only; it
    /// never feeds back into resolution.
    pub detected_at: Timestamp,
    /// Captured error detail for unhandled-abort records.
    pub error: Option<String>,
}

pub fn now_micros() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// The durable sink failed; treated as fatal by callers.
#[derive(Debug, Error)]
#[error("conflict sink error: {0}")]
pub struct SinkError(pub String);

/// Durable conflict-history storage.
#[async_trait]
pub trait ConflictSink: Send + Sync {
    async fn append(&self, record: &ConflictRecord) -> Result<(), SinkError>;
}

/// In-memory [`ConflictSink`] for tests and inspection.
#[derive(Default)]
pub struct MemoryConflictSink {
    records: std::sync::Mutex<Vec<ConflictRecord>>,
}

impl MemoryConflictSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ConflictRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConflictSink for MemoryConflictSink {
    async fn append(&self, record: &ConflictRecord) -> Result<(), SinkError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Operator-visible counters, updated lock-free.
#[derive(Debug, Default)]
pub struct ConflictStats {
    insert_insert: AtomicU64,
    insert_update: AtomicU64,
    update_update: AtomicU64,
    update_delete: AtomicU64,
    delete_delete: AtomicU64,
    unhandled_abort: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

/// Point-in-time copy of [`ConflictStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConflictStatsSnapshot {
    pub insert_insert: u64,
    pub insert_update: u64,
    pub update_update: u64,
    pub update_delete: u64,
    pub delete_delete: u64,
    pub unhandled_abort: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl ConflictStatsSnapshot {
    pub fn total_conflicts(&self) -> u64 {
        self.insert_insert
            + self.insert_update
            + self.update_update
            + self.update_delete
            + self.delete_delete
            + self.unhandled_abort
    }
}

impl ConflictStats {
    pub fn note_conflict(&self, kind: ConflictType) {
        let counter = match kind {
            ConflictType::InsertInsert => &self.insert_insert,
            ConflictType::InsertUpdate => &self.insert_update,
            ConflictType::UpdateUpdate => &self.update_update,
            ConflictType::UpdateDelete => &self.update_delete,
            ConflictType::DeleteDelete => &self.delete_delete,
            ConflictType::UnhandledAbort => &self.unhandled_abort,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_apply(&self, kind: ChangeKind) {
        let counter = match kind {
            ChangeKind::Insert => &self.inserts,
            ChangeKind::Update => &self.updates,
            ChangeKind::Delete => &self.deletes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConflictStatsSnapshot {
        ConflictStatsSnapshot {
            insert_insert: self.insert_insert.load(Ordering::Relaxed),
            insert_update: self.insert_update.load(Ordering::Relaxed),
            update_update: self.update_update.load(Ordering::Relaxed),
            update_delete: self.update_delete.load(Ordering::Relaxed),
            delete_delete: self.delete_delete.load(Ordering::Relaxed),
            unhandled_abort: self.unhandled_abort.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Dual-sink conflict log.
pub struct ConflictLog {
    sink: Option<Arc<dyn ConflictSink>>,
    include_tuples: bool,
    stats: Arc<ConflictStats>,
}

impl ConflictLog {
    /// `sink` is consulted only when table logging is enabled in config;
    /// passing `None` disables the durable sink outright.
    pub fn new(sink: Option<Arc<dyn ConflictSink>>, include_tuples: bool) -> Self {
        Self {
            sink,
            include_tuples,
            stats: Arc::new(ConflictStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ConflictStats> {
        self.stats.clone()
    }

    /// Record one conflict: bump counters, emit the log line, and append to
    /// the durable sink when configured.
    pub async fn record(&self, record: &ConflictRecord) -> Result<(), SinkError> {
        self.stats.note_conflict(record.kind);

        log::info!(
            target: "meshsync::conflict",
            "{} conflict on {}({}) from {}: {}",
            record.kind,
            record.relation,
            record.key,
            record.remote_origin,
            record.resolution,
        );
        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                target: "meshsync::conflict",
                "conflict {} detail: local={} remote={}",
                record.id,
                serde_json::to_string(&record.local_tuple).unwrap_or_default(),
                serde_json::to_string(&record.remote_tuple).unwrap_or_default(),
            );
        }

        if let Some(sink) = &self.sink {
            if self.include_tuples {
                sink.append(record).await?;
            } else {
                let mut stripped = record.clone();
                stripped.local_tuple = None;
                stripped.remote_tuple = None;
                sink.append(&stripped).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(kind: ConflictType) -> ConflictRecord {
        ConflictRecord {
            id: Uuid::new_v4(),
            relation: "tasks".into(),
            key: "[1]".into(),
            kind,
            resolution: Resolution::LastWriterWinsRemote,
            local_origin: Some(NodeIdentity::new(1, 1, 1)),
            local_commit_time: Some(100),
            local_txid: Some(10),
            local_tuple: Some(Tuple::from([("id", json!(1))])),
            remote_origin: NodeIdentity::new(2, 1, 1),
            remote_commit_time: 105,
            remote_commit_lsn: 50,
            remote_txid: 900,
            remote_tuple: Some(Tuple::from([("id", json!(1))])),
            detected_at: now_micros(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_record_bumps_type_counter() {
        let log = ConflictLog::new(None, false);
        log.record(&record(ConflictType::InsertInsert)).await.unwrap();
        log.record(&record(ConflictType::InsertInsert)).await.unwrap();
        log.record(&record(ConflictType::UpdateDelete)).await.unwrap();
        let snap = log.stats().snapshot();
        assert_eq!(snap.insert_insert, 2);
        assert_eq!(snap.update_delete, 1);
        assert_eq!(snap.total_conflicts(), 3);
    }

    #[tokio::test]
    async fn test_sink_receives_record() {
        let sink = Arc::new(MemoryConflictSink::new());
        let log = ConflictLog::new(Some(sink.clone()), true);
        log.record(&record(ConflictType::UpdateUpdate)).await.unwrap();
        let persisted = sink.records();
        assert_eq!(persisted.len(), 1);
        assert!(persisted[0].local_tuple.is_some());
    }

    #[tokio::test]
    async fn test_tuples_stripped_when_disabled() {
        let sink = Arc::new(MemoryConflictSink::new());
        let log = ConflictLog::new(Some(sink.clone()), false);
        log.record(&record(ConflictType::UpdateUpdate)).await.unwrap();
        let persisted = sink.records();
        assert!(persisted[0].local_tuple.is_none());
        assert!(persisted[0].remote_tuple.is_none());
        // Metadata survives even when images are stripped.
        assert_eq!(persisted[0].local_commit_time, Some(100));
    }

    #[tokio::test]
    async fn test_sink_failure_propagates() {
        struct FailingSink;
        #[async_trait]
        impl ConflictSink for FailingSink {
            async fn append(&self, _: &ConflictRecord) -> Result<(), SinkError> {
                Err(SinkError("disk full".into()))
            }
        }
        let log = ConflictLog::new(Some(Arc::new(FailingSink)), false);
        assert!(log.record(&record(ConflictType::DeleteDelete)).await.is_err());
    }
}
