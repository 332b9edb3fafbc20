//! # MeshSync
//!
//! The conflict-resolution and coordination core of a multi-master
//! logical-replication engine.
//!
//! Multiple database nodes apply each other's row-level changes
//! asynchronously. MeshSync detects when two nodes' changes collide,
//! resolves the collision deterministically (registered handler, then
//! last-writer-wins, then a configured default), allocates globally-unique
//! sequence values through leader-less chunk elections, and serializes
//! schema changes behind a replicated global DDL lock. Given the same pair
//! of changes, every node reaches the same verdict in either arrival order,
//! which is what makes multi-master replication converge.
//!
//! Transport, logical decoding, and row storage are collaborators behind
//! trait seams ([`PeerBus`], [`TupleStore`], [`ChunkStore`],
//! [`ConflictSink`]); in-process implementations back the tests and
//! embedded use.
//!
//! ## Quick start
//!
//! ```ignore
//! use meshsync::{EngineBuilder, NodeIdentity, RelationMeta};
//!
//! let engine = EngineBuilder::new(NodeIdentity::new(sysid, 1, dboid))
//!     .with_bus(bus)
//!     .with_tuple_store(store)
//!     .build();
//!
//! engine.register_relation(RelationMeta {
//!     name: "tasks".into(),
//!     key_columns: vec!["id".into()],
//!     columns: vec!["id".into(), "title".into()],
//! });
//!
//! // One apply worker per remote peer; the decode pipeline feeds it.
//! let worker = engine.apply_worker(remote);
//! let verdict = worker.apply(&change).await?;
//!
//! // Sequence values are unique cluster-wide, no central allocator.
//! let id = engine.sequences().next_value("orders_id_seq").await?;
//! ```
//!
//! ## Key types
//!
//! - [`Engine`] / [`EngineBuilder`] — per-node wiring and background loops
//! - [`ApplyWorker`] — classify + resolve + apply for one origin's stream
//! - [`Change`] — a decoded remote DML operation
//! - [`ConflictHandler`] — user resolver consulted before last-writer-wins
//! - [`SequenceHandle`] — chunked distributed sequence allocation
//! - [`DdlLockHandle`] — replicated global DDL lock

pub mod apply;
pub mod bus;
pub mod change;
pub mod config;
pub mod conflict;
pub mod conflict_log;
pub mod ddl_lock;
pub mod engine;
pub mod handlers;
pub mod identity;
pub mod messages;
pub mod registry;
pub mod resolver;
pub mod sequence;
pub mod statement;
pub mod storage;
pub mod workers;

pub use apply::{ApplyError, ApplyVerdict, ApplyWorker};
pub use bus::{LocalBus, PeerBus};
pub use change::{Change, ChangeKind, Lsn, RowKey, Timestamp, Tuple, TxId};
pub use config::Config;
pub use conflict::{ApplyAction, ConflictOutcome, ConflictType, DetectedConflict, classify};
pub use conflict_log::{
    ConflictLog, ConflictRecord, ConflictSink, ConflictStatsSnapshot, MemoryConflictSink,
};
pub use ddl_lock::{DdlLockHandle, DdlLockStatus, LockError};
pub use engine::{Engine, EngineBuilder};
pub use handlers::{ConflictHandler, HandlerError, HandlerRegistry, HandlerVerdict};
pub use identity::NodeIdentity;
pub use messages::{Envelope, LockMode, PeerMessage, SequenceChunk, Vote};
pub use registry::{RelationMeta, RelationRegistry};
pub use resolver::{DefaultResolution, Resolution, Verdict, resolve};
pub use sequence::{SequenceError, SequenceHandle, SequenceStatus};
pub use statement::{StatementKind, classify_statement};
pub use storage::{
    ChunkStore, LocalState, MemoryChunkStore, MemoryStore, StoredTuple, Tombstone, TupleStore,
    WriterMeta,
};
pub use workers::{ApplyControl, Worker, WorkerRegistry};
