//! Replicated change records.
//!
//! A [`Change`] is what the decode pipeline hands us for every replicated DML
//! operation: the relation, the old/new tuple images, and the commit metadata
//! of the originating transaction. Changes are immutable; the apply worker
//! consumes one, classifies it against local state, and discards it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::NodeIdentity;

/// Log sequence number of a commit on the originating node.
pub type Lsn = u64;

/// Commit timestamp in microseconds since the Unix epoch.
///
/// Timestamps come from the originating node's commit record, never from a
/// local clock, so two nodes resolving the same pair of changes compare the
/// same numbers.
pub type Timestamp = u64;

/// Transaction id on the originating node.
pub type TxId = u32;

/// A row image: column name to JSON value, ordered by column name.
///
/// `BTreeMap` keeps iteration deterministic, which matters when keys are
/// rendered for logging and row lookup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tuple(pub BTreeMap<String, Value>);

impl Tuple {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Project the replica-identity key columns into a [`RowKey`].
    ///
    /// Returns `None` when a key column is missing from the image, which the
    /// caller must treat as a malformed replica identity, fatal to the apply
    /// process.
    pub fn project_key(&self, key_columns: &[String]) -> Option<RowKey> {
        let mut values = Vec::with_capacity(key_columns.len());
        for col in key_columns {
            values.push(self.0.get(col)?);
        }
        Some(RowKey(
            serde_json::to_string(&values).unwrap_or_default(),
        ))
    }
}

impl<const N: usize> From<[(&str, Value); N]> for Tuple {
    fn from(entries: [(&str, Value); N]) -> Self {
        Tuple(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }
}

/// Canonical rendering of a row's replica-identity key.
///
/// Two tuples with the same key values produce the same `RowKey` on every
/// node, so it doubles as the row-store lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowKey(pub String);

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of DML operation a change carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        })
    }
}

/// One replicated DML operation, as decoded from a remote node's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    /// Relation (table) the change applies to.
    pub relation: String,
    pub kind: ChangeKind,
    /// Old tuple image; present for updates and deletes.
    pub old: Option<Tuple>,
    /// New tuple image; present for inserts and updates.
    pub new: Option<Tuple>,
    /// Node where the transaction originally committed.
    pub origin: NodeIdentity,
    pub remote_txid: TxId,
    pub commit_lsn: Lsn,
    pub commit_time: Timestamp,
}

impl Change {
    /// The tuple image carrying the replica-identity key for this change.
    ///
    /// Updates identify the row by the old image when the decode pipeline
    /// provides one (the key may itself have been updated); inserts only have
    /// a new image, deletes only an old one.
    pub fn key_image(&self) -> Option<&Tuple> {
        match self.kind {
            ChangeKind::Insert => self.new.as_ref(),
            ChangeKind::Update => self.old.as_ref().or(self.new.as_ref()),
            ChangeKind::Delete => self.old.as_ref(),
        }
    }
}
