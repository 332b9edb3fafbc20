//! Node identity.
//!
//! Every replication origin in the cluster is named by a [`NodeIdentity`]:
//! the 64-bit system identifier, the timeline, and the database id. The
//! triple is immutable once a node joins. It tags every replicated change,
//! identifies voters in sequence elections, and breaks ties deterministically
//! because its ordering is total and identical on every node.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a replication origin: `(system id, timeline, database)`.
///
/// The derived `Ord` compares fields in declaration order, so the system id
/// dominates. Election and lock tie-breaks rely on this being a total order
/// that every node computes identically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeIdentity {
    /// 64-bit system identifier, unique per node.
    pub sysid: u64,
    /// Timeline id of the node's storage history.
    pub timeline: u32,
    /// Database id the node replicates for.
    pub dboid: u32,
}

impl NodeIdentity {
    pub fn new(sysid: u64, timeline: u32, dboid: u32) -> Self {
        Self {
            sysid,
            timeline,
            dboid,
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.sysid, self.timeline, self.dboid)
    }
}
