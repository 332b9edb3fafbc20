//! Inter-node wire messages.
//!
//! Everything the coordination loops exchange travels as a [`PeerMessage`]
//! inside an [`Envelope`]. The enum is serde-tagged so real transports can
//! serialize it however they like; the in-process [`LocalBus`](crate::bus::LocalBus)
//! passes the typed values straight through. The substrate guarantees only
//! per-peer-pair delivery order, and both control loops are written to
//! tolerate lost messages.

use serde::{Deserialize, Serialize};

use crate::identity::NodeIdentity;

/// A contiguous range of sequence values `[start, end)` owned by one node.
///
/// At most one node owns any given value for a `(sequence, epoch)` pair;
/// the election tie-break enforces this, not locking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceChunk {
    pub sequence: String,
    pub start: u64,
    pub end: u64,
    pub owner: NodeIdentity,
    pub epoch: u64,
}

impl SequenceChunk {
    pub fn overlaps(&self, other: &SequenceChunk) -> bool {
        self.sequence == other.sequence && self.start < other.end && other.start < self.end
    }
}

/// A ballot in a sequence election.
///
/// A vote whose `voter` equals the chunk's `owner` is a proposal; any other
/// voter is an endorsement of that proposal. Votes are ephemeral and
/// discarded once the round closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub chunk: SequenceChunk,
    pub epoch: u64,
    pub voter: NodeIdentity,
}

/// Mode requested for the global DDL lock.
///
/// `Ddl` serializes schema changes; `Write` additionally quiesces apply on
/// the peers. Exclusivity is identical for both, the mode is recorded so
/// operators can see why the cluster is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Ddl,
    Write,
}

/// Tagged wire message between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Sequence election proposal or endorsement.
    SequenceVote(Vote),
    /// A closed election round: the range is now owned and must be skipped
    /// by future proposals.
    SequenceClaim(SequenceChunk),
    /// Global-lock acquisition request, ordered by the join-seeded counter.
    LockRequest {
        requester: NodeIdentity,
        counter: u64,
        mode: LockMode,
    },
    /// Acknowledgment that a request has been queued. `deferred` means the
    /// acker holds the lock or knows an earlier queued request.
    LockAck {
        from: NodeIdentity,
        requester: NodeIdentity,
        counter: u64,
        deferred: bool,
    },
    /// Release (or withdrawal) of the request identified by
    /// `(counter, holder)`.
    LockRelease { holder: NodeIdentity, counter: u64 },
}

/// A message plus the node it came from, as delivered by the bus.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: NodeIdentity,
    pub msg: PeerMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seq: &str, start: u64, end: u64, sysid: u64) -> SequenceChunk {
        SequenceChunk {
            sequence: seq.into(),
            start,
            end,
            owner: NodeIdentity::new(sysid, 1, 1),
            epoch: 1,
        }
    }

    #[test]
    fn test_overlap_requires_same_sequence() {
        let a = chunk("a", 1, 100, 1);
        let b = chunk("b", 1, 100, 2);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn test_adjacent_ranges_do_not_overlap() {
        let a = chunk("s", 1, 100, 1);
        let b = chunk("s", 100, 200, 2);
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn test_partial_overlap_detected() {
        let a = chunk("s", 1, 100, 1);
        let b = chunk("s", 50, 150, 2);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }
}
