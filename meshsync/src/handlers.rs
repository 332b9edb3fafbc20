//! Per-relation conflict handlers.
//!
//! A handler is a registered callback consulted before the built-in
//! last-writer-wins policy. Handlers are keyed by relation and conflict
//! type, optionally restricted to a timeframe window measured between the
//! two commit timestamps. Registrations are cached per relation and
//! invalidated atomically when the relation cache is invalidated.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::change::{Timestamp, Tuple};
use crate::conflict::ConflictType;

/// What a handler decided.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerVerdict {
    /// Skip the remote change; the local state stands.
    Skip,
    /// Write this tuple instead of either side's version.
    Replace(Tuple),
}

/// A handler invocation failed; escalated to unhandled-abort by the caller.
#[derive(Debug, Error)]
#[error("conflict handler failed: {0}")]
pub struct HandlerError(pub String);

type HandlerFn =
    dyn Fn(ConflictType, Option<&Tuple>, Option<&Tuple>) -> Result<HandlerVerdict, HandlerError>
        + Send
        + Sync;

/// One registered conflict handler.
pub struct ConflictHandler {
    name: String,
    kind: ConflictType,
    /// Maximum distance between the local and remote commit timestamps, in
    /// microseconds, for this handler to be consulted. `None` means always.
    timeframe: Option<u64>,
    resolver: Box<HandlerFn>,
}

impl ConflictHandler {
    pub fn new<F>(name: impl Into<String>, kind: ConflictType, timeframe: Option<u64>, f: F) -> Self
    where
        F: Fn(ConflictType, Option<&Tuple>, Option<&Tuple>) -> Result<HandlerVerdict, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            kind,
            timeframe,
            resolver: Box::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handler applies to a conflict of `kind` whose sides
    /// committed at the given timestamps.
    ///
    /// A timeframe-restricted handler only matches when the local commit
    /// time is known; an untimed handler always matches its type.
    pub fn matches(
        &self,
        kind: ConflictType,
        local_commit: Option<Timestamp>,
        remote_commit: Timestamp,
    ) -> bool {
        if self.kind != kind {
            return false;
        }
        match self.timeframe {
            None => true,
            Some(window) => match local_commit {
                Some(local) => local.abs_diff(remote_commit) <= window,
                None => false,
            },
        }
    }

    pub fn invoke(
        &self,
        kind: ConflictType,
        local: Option<&Tuple>,
        remote: Option<&Tuple>,
    ) -> Result<HandlerVerdict, HandlerError> {
        (self.resolver)(kind, local, remote)
    }
}

impl std::fmt::Debug for ConflictHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictHandler")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("timeframe", &self.timeframe)
            .finish()
    }
}

/// Registry of conflict handlers, keyed by relation name.
///
/// Lookup hands out the cached `Arc` slice, so the apply hot path never
/// clones handlers; registration and invalidation rebuild the slice under
/// the write lock.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    relations: RwLock<HashMap<String, Arc<Vec<Arc<ConflictHandler>>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a relation. Handlers are consulted in
    /// registration order; the first match wins.
    pub fn register(&self, relation: &str, handler: ConflictHandler) {
        let mut relations = self.relations.write().unwrap();
        let entry = relations.entry(relation.to_string()).or_default();
        let mut handlers: Vec<Arc<ConflictHandler>> = entry.as_ref().clone();
        handlers.push(Arc::new(handler));
        *entry = Arc::new(handlers);
    }

    /// All handlers registered for a relation, in registration order.
    pub fn lookup(&self, relation: &str) -> Arc<Vec<Arc<ConflictHandler>>> {
        self.relations
            .read()
            .unwrap()
            .get(relation)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the cached handlers for a relation.
    pub fn invalidate(&self, relation: &str) {
        self.relations.write().unwrap().remove(relation);
    }
}
