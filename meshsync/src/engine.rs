//! Engine wiring.
//!
//! One [`Engine`] per node owns the configuration, the registries, the
//! conflict log, and the two coordination loops. [`EngineBuilder`] attaches
//! the node to the peer bus and spawns three background tasks: the sequence
//! coordinator, the lock coordinator, and a router that dispatches inbound
//! peer messages to whichever loop they belong to. Dropping the engine (and
//! every handle cloned from it) closes the channels and winds the tasks
//! down.

use std::sync::Arc;

use crate::apply::ApplyWorker;
use crate::bus::{LocalBus, PeerBus};
use crate::config::Config;
use crate::conflict_log::{ConflictLog, ConflictSink, ConflictStatsSnapshot};
use crate::ddl_lock::{self, DdlLockHandle, LockError};
use crate::handlers::{ConflictHandler, HandlerRegistry};
use crate::identity::NodeIdentity;
use crate::messages::{Envelope, LockMode, PeerMessage};
use crate::registry::{RelationMeta, RelationRegistry};
use crate::sequence::{self, SequenceHandle};
use crate::statement::classify_statement;
use crate::storage::{ChunkStore, MemoryChunkStore, MemoryStore, TupleStore};
use crate::workers::WorkerRegistry;

/// Builder for [`Engine`].
pub struct EngineBuilder {
    node: NodeIdentity,
    config: Config,
    bus: Option<Arc<dyn PeerBus>>,
    tuple_store: Option<Arc<dyn TupleStore>>,
    chunk_store: Option<Arc<dyn ChunkStore>>,
    conflict_sink: Option<Arc<dyn ConflictSink>>,
    join_counter: u64,
}

impl EngineBuilder {
    pub fn new(node: NodeIdentity) -> Self {
        Self {
            node,
            config: Config::default(),
            bus: None,
            tuple_store: None,
            chunk_store: None,
            conflict_sink: None,
            join_counter: 0,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn PeerBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_tuple_store(mut self, store: Arc<dyn TupleStore>) -> Self {
        self.tuple_store = Some(store);
        self
    }

    pub fn with_chunk_store(mut self, store: Arc<dyn ChunkStore>) -> Self {
        self.chunk_store = Some(store);
        self
    }

    pub fn with_conflict_sink(mut self, sink: Arc<dyn ConflictSink>) -> Self {
        self.conflict_sink = Some(sink);
        self
    }

    /// Seed for the lock-request counter, assigned at cluster join. Later
    /// joiners get higher seeds so queue order stays globally comparable.
    pub fn with_join_counter(mut self, counter: u64) -> Self {
        self.join_counter = counter;
        self
    }

    /// Attach to the bus and spawn the background loops. Must be called
    /// within a tokio runtime.
    pub fn build(self) -> Engine {
        let bus: Arc<dyn PeerBus> = self.bus.unwrap_or_else(|| LocalBus::new());
        let tuple_store = self
            .tuple_store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let chunk_store = self
            .chunk_store
            .unwrap_or_else(|| Arc::new(MemoryChunkStore::new()));

        let sink = if self.config.log_conflicts_to_table {
            self.conflict_sink
        } else {
            None
        };
        let log = Arc::new(ConflictLog::new(
            sink,
            self.config.conflict_logging_include_tuples,
        ));

        let mut rx = bus.attach(self.node);

        let sequences = sequence::spawn(
            self.node,
            bus.clone(),
            chunk_store,
            self.config.chunk_size,
            self.config.sequence_chunk_sizes.clone(),
            self.config.election_window,
        );
        let ddl_lock = ddl_lock::spawn(
            self.node,
            bus.clone(),
            self.join_counter,
            self.config.lock_timeout,
            self.config.lock_backoff,
        );

        let workers = Arc::new(WorkerRegistry::new());
        workers.register_coordinator(self.node);

        // Router: one task fanning inbound peer messages out to the loops.
        let seq_handle = sequences.clone();
        let lock_handle = ddl_lock.clone();
        let node = self.node;
        tokio::spawn(async move {
            while let Some(Envelope { from, msg }) = rx.recv().await {
                match msg {
                    PeerMessage::SequenceVote(vote) => {
                        seq_handle.deliver_vote(from, vote).await;
                    }
                    PeerMessage::SequenceClaim(chunk) => {
                        seq_handle.deliver_claim(chunk).await;
                    }
                    msg @ (PeerMessage::LockRequest { .. }
                    | PeerMessage::LockAck { .. }
                    | PeerMessage::LockRelease { .. }) => {
                        lock_handle.deliver(from, msg).await;
                    }
                }
            }
            log::debug!("message router for {node} stopped");
        });

        Engine {
            node: self.node,
            config: Arc::new(self.config),
            store: tuple_store,
            relations: Arc::new(RelationRegistry::new()),
            handlers: Arc::new(HandlerRegistry::new()),
            workers,
            log,
            sequences,
            ddl_lock,
        }
    }
}

/// A node's coordination core.
pub struct Engine {
    node: NodeIdentity,
    config: Arc<Config>,
    store: Arc<dyn TupleStore>,
    relations: Arc<RelationRegistry>,
    handlers: Arc<HandlerRegistry>,
    workers: Arc<WorkerRegistry>,
    log: Arc<ConflictLog>,
    sequences: SequenceHandle,
    ddl_lock: DdlLockHandle,
}

impl Engine {
    pub fn node(&self) -> NodeIdentity {
        self.node
    }

    pub fn register_relation(&self, meta: RelationMeta) {
        self.relations.register(meta);
    }

    pub fn register_handler(&self, relation: &str, handler: ConflictHandler) {
        self.handlers.register(relation, handler);
    }

    /// Invalidate a relation's cached metadata and conflict handlers, as on
    /// relation-cache invalidation.
    pub fn invalidate_relation(&self, relation: &str) {
        self.relations.invalidate(relation);
        self.handlers.invalidate(relation);
    }

    /// Create the apply worker serving one remote origin's change stream.
    pub fn apply_worker(&self, origin: NodeIdentity) -> ApplyWorker {
        self.workers.register_apply(origin);
        ApplyWorker::new(
            origin,
            self.store.clone(),
            self.relations.clone(),
            self.handlers.clone(),
            self.log.clone(),
            self.workers.clone(),
            self.config.default_resolution,
        )
    }

    /// Handle for sequence allocation.
    pub fn sequences(&self) -> SequenceHandle {
        self.sequences.clone()
    }

    /// Handle for the global DDL lock.
    pub fn ddl_lock(&self) -> DdlLockHandle {
        self.ddl_lock.clone()
    }

    /// Worker registry: pause/resume apply, stop positions, slot listing.
    pub fn workers(&self) -> Arc<WorkerRegistry> {
        self.workers.clone()
    }

    pub fn conflict_stats(&self) -> ConflictStatsSnapshot {
        self.log.stats().snapshot()
    }

    /// Gate a statement on the global DDL lock: DDL-bearing statements
    /// block until the lock is granted; everything else passes through.
    ///
    /// Returns whether the lock was taken; the caller releases it once the
    /// statement's replicated effects are durable.
    pub async fn acquire_for_statement(&self, sql: &str) -> Result<bool, LockError> {
        if !classify_statement(sql).is_ddl() {
            return Ok(false);
        }
        self.ddl_lock.acquire(LockMode::Ddl).await?;
        Ok(true)
    }
}
