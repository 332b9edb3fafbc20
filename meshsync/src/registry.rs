//! Relation registry.
//!
//! The [`RelationRegistry`] is the central lookup used by apply workers to
//! find a relation's replica-identity key columns before classifying a
//! change. Entries are registered at relation-open time and invalidated
//! together with the relation's conflict handlers when the relation cache
//! is invalidated.

use std::collections::HashMap;
use std::sync::RwLock;

/// Metadata about a replicated relation.
#[derive(Debug, Clone)]
pub struct RelationMeta {
    /// The relation name (e.g., `"tasks"`).
    pub name: String,
    /// Replica-identity key columns used to match rows across nodes.
    pub key_columns: Vec<String>,
    /// All column names in the relation.
    pub columns: Vec<String>,
}

/// Registry of relations participating in replication.
///
/// Thread-safe via interior `RwLock`. Shared between apply workers (which
/// look up key columns on every change) and the engine (which registers and
/// invalidates entries).
#[derive(Debug, Default)]
pub struct RelationRegistry {
    relations: RwLock<HashMap<String, RelationMeta>>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a relation. Replaces any existing entry with the same name.
    pub fn register(&self, meta: RelationMeta) {
        let name = meta.name.clone();
        self.relations.write().unwrap().insert(name, meta);
    }

    /// Look up metadata for a relation by name.
    pub fn get(&self, name: &str) -> Option<RelationMeta> {
        self.relations.read().unwrap().get(name).cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.relations.read().unwrap().contains_key(name)
    }

    /// Drop a relation from the cache.
    pub fn invalidate(&self, name: &str) {
        self.relations.write().unwrap().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> RelationMeta {
        RelationMeta {
            name: name.into(),
            key_columns: vec!["id".into()],
            columns: vec!["id".into(), "title".into()],
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = RelationRegistry::new();
        reg.register(meta("tasks"));
        assert!(reg.is_registered("tasks"));
        assert_eq!(reg.get("tasks").unwrap().key_columns, vec!["id"]);
        assert!(reg.get("users").is_none());
    }

    #[test]
    fn test_register_replaces_existing() {
        let reg = RelationRegistry::new();
        reg.register(meta("tasks"));
        reg.register(RelationMeta {
            name: "tasks".into(),
            key_columns: vec!["uuid".into()],
            columns: vec!["uuid".into()],
        });
        assert_eq!(reg.get("tasks").unwrap().key_columns, vec!["uuid"]);
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let reg = RelationRegistry::new();
        reg.register(meta("tasks"));
        reg.invalidate("tasks");
        assert!(!reg.is_registered("tasks"));
    }
}
