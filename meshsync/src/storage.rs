//! Storage seams.
//!
//! The core never touches heap or index access methods directly; it reads
//! and writes tuples through [`TupleStore`] and persists sequence progress
//! through [`ChunkStore`]. The in-memory implementations here back the test
//! suite and embedded single-process use; a real deployment implements the
//! traits over its row store.
//!
//! The store keeps last-writer metadata next to every live row and retains a
//! tombstone for every deleted key. Both are what conflict classification
//! keys on: origin tracking suppresses self-conflicts, tombstones separate
//! update-delete races from plain inserts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::change::{RowKey, Timestamp, Tuple, TxId};
use crate::identity::NodeIdentity;
use crate::messages::SequenceChunk;

/// Last-writer metadata recorded with every stored row and tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterMeta {
    pub origin: NodeIdentity,
    pub commit_time: Timestamp,
    pub txid: TxId,
}

/// A live local row plus the metadata of the transaction that last wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTuple {
    pub tuple: Tuple,
    pub writer: WriterMeta,
}

/// Retained marker for a deleted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub writer: WriterMeta,
}

/// Everything the classifier needs to know about a key's local state.
#[derive(Debug, Clone, Default)]
pub struct LocalState {
    pub row: Option<StoredTuple>,
    /// Set only while no live row exists for the key.
    pub tombstone: Option<Tombstone>,
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// Exclusive per-key lock, held across classify + resolve + apply so a second
/// apply worker cannot observe a half-resolved state for the same row.
pub struct KeyLock {
    relation: String,
    key: RowKey,
    _guard: OwnedMutexGuard<()>,
}

impl KeyLock {
    pub fn new(relation: String, key: RowKey, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            relation,
            key,
            _guard: guard,
        }
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    pub fn key(&self) -> &RowKey {
        &self.key
    }
}

/// Keyed tuple storage, the seam to the local row store.
#[async_trait]
pub trait TupleStore: Send + Sync {
    /// Take the per-key lock. All reads and writes for the key happen while
    /// the returned lock is alive.
    async fn lock_key(&self, relation: &str, key: &RowKey) -> Result<KeyLock, StoreError>;

    async fn read(&self, lock: &KeyLock) -> Result<LocalState, StoreError>;

    /// Write or replace the row. Clears any tombstone for the key.
    async fn put(&self, lock: &KeyLock, tuple: Tuple, writer: WriterMeta)
    -> Result<(), StoreError>;

    /// Remove the row and retain a tombstone recording the deleting writer.
    async fn delete(&self, lock: &KeyLock, writer: WriterMeta) -> Result<(), StoreError>;
}

type Slot = (Option<StoredTuple>, Option<Tombstone>);

/// In-memory [`TupleStore`] with per-key tokio mutexes.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<(String, RowKey), Slot>>,
    locks: Mutex<HashMap<(String, RowKey), Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live tuple for a key, for assertions and inspection. Does not
    /// take the key lock.
    pub fn get(&self, relation: &str, key: &RowKey) -> Option<Tuple> {
        let rows = self.rows.lock().unwrap();
        rows.get(&(relation.to_string(), key.clone()))
            .and_then(|slot| slot.0.as_ref())
            .map(|row| row.tuple.clone())
    }

    /// Number of live rows in a relation.
    pub fn live_rows(&self, relation: &str) -> usize {
        let rows = self.rows.lock().unwrap();
        rows.iter()
            .filter(|((rel, _), slot)| rel == relation && slot.0.is_some())
            .count()
    }
}

#[async_trait]
impl TupleStore for MemoryStore {
    async fn lock_key(&self, relation: &str, key: &RowKey) -> Result<KeyLock, StoreError> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry((relation.to_string(), key.clone()))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        Ok(KeyLock::new(relation.to_string(), key.clone(), guard))
    }

    async fn read(&self, lock: &KeyLock) -> Result<LocalState, StoreError> {
        let rows = self.rows.lock().unwrap();
        let slot = rows.get(&(lock.relation().to_string(), lock.key().clone()));
        Ok(LocalState {
            row: slot.and_then(|s| s.0.clone()),
            tombstone: slot.and_then(|s| s.1),
        })
    }

    async fn put(
        &self,
        lock: &KeyLock,
        tuple: Tuple,
        writer: WriterMeta,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        rows.insert(
            (lock.relation().to_string(), lock.key().clone()),
            (Some(StoredTuple { tuple, writer }), None),
        );
        Ok(())
    }

    async fn delete(&self, lock: &KeyLock, writer: WriterMeta) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        rows.insert(
            (lock.relation().to_string(), lock.key().clone()),
            (None, Some(Tombstone { writer })),
        );
        Ok(())
    }
}

/// Persisted progress for one sequence: the owned chunk and the next
/// unallocated value inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedChunk {
    pub chunk: SequenceChunk,
    pub next: u64,
}

/// Durable high-water bookkeeping for sequence chunks.
///
/// Saved after every allocation so a restart never re-hands-out a value.
/// The remainder of a chunk lost in a crash is abandoned, not reused.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn load(&self, sequence: &str) -> Result<Option<PersistedChunk>, StoreError>;
    async fn save(&self, progress: &PersistedChunk) -> Result<(), StoreError>;
}

/// In-memory [`ChunkStore`].
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<HashMap<String, PersistedChunk>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn load(&self, sequence: &str) -> Result<Option<PersistedChunk>, StoreError> {
        Ok(self.chunks.lock().unwrap().get(sequence).cloned())
    }

    async fn save(&self, progress: &PersistedChunk) -> Result<(), StoreError> {
        self.chunks
            .lock()
            .unwrap()
            .insert(progress.chunk.sequence.clone(), progress.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn writer(sysid: u64, commit_time: Timestamp) -> WriterMeta {
        WriterMeta {
            origin: NodeIdentity::new(sysid, 1, 1),
            commit_time,
            txid: 1,
        }
    }

    #[tokio::test]
    async fn test_put_clears_tombstone() {
        let store = MemoryStore::new();
        let key = RowKey("[1]".into());
        let lock = store.lock_key("t", &key).await.unwrap();

        store.delete(&lock, writer(1, 100)).await.unwrap();
        let state = store.read(&lock).await.unwrap();
        assert!(state.row.is_none());
        assert!(state.tombstone.is_some());

        store
            .put(&lock, Tuple::from([("id", json!(1))]), writer(2, 200))
            .await
            .unwrap();
        let state = store.read(&lock).await.unwrap();
        assert!(state.row.is_some());
        assert!(state.tombstone.is_none());
    }

    #[tokio::test]
    async fn test_key_lock_serializes_writers() {
        let store = Arc::new(MemoryStore::new());
        let key = RowKey("[7]".into());
        let lock = store.lock_key("t", &key).await.unwrap();

        let store2 = store.clone();
        let key2 = key.clone();
        let contender = tokio::spawn(async move {
            let lock2 = store2.lock_key("t", &key2).await.unwrap();
            store2
                .put(&lock2, Tuple::from([("id", json!(7))]), writer(2, 2))
                .await
                .unwrap();
        });

        // The contender cannot proceed while we hold the lock.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(lock);
        contender.await.unwrap();
        assert!(store.get("t", &key).is_some());
    }

    #[tokio::test]
    async fn test_chunk_store_round_trip() {
        let store = MemoryChunkStore::new();
        assert!(store.load("s").await.unwrap().is_none());
        let progress = PersistedChunk {
            chunk: SequenceChunk {
                sequence: "s".into(),
                start: 1,
                end: 1001,
                owner: NodeIdentity::new(1, 1, 1),
                epoch: 1,
            },
            next: 42,
        };
        store.save(&progress).await.unwrap();
        assert_eq!(store.load("s").await.unwrap().unwrap().next, 42);
    }
}
