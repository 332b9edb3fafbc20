//! Distributed sequence allocation.
//!
//! Sequences hand out globally-unique values without a central allocator by
//! batching them into chunks. A node claims a chunk through a leader-less
//! election: it proposes the next unclaimed range, broadcasts a [`Vote`],
//! collects endorsements for a bounded window, and on winning serves
//! allocations locally until the chunk is exhausted. Uniqueness comes from
//! the tie-break (overlapping proposals in a round go to the lower system
//! id) and liveness from losers strictly advancing their proposed range, so
//! every node eventually wins some chunk.
//!
//! Per sequence the state machine is `Idle → Electing → Owned → Exhausted →
//! Electing → …`. Voters that never respond are simply not counted; a round
//! closes when a majority of reachable voters endorsed the proposal or when
//! the window expires with whatever arrived. A crashed owner's unused values
//! are abandoned, never reused.
//!
//! The coordinator is one tokio task fed by an mpsc channel: allocation
//! requests carry a oneshot reply, votes and claims are forwarded by the
//! engine's router loop. No other thread touches its state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::bus::PeerBus;
use crate::identity::NodeIdentity;
use crate::messages::{PeerMessage, SequenceChunk, Vote};
use crate::storage::{ChunkStore, PersistedChunk, StoreError};

#[derive(Debug, Clone, Error)]
pub enum SequenceError {
    #[error("sequence coordinator shut down")]
    Shutdown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Operator-visible snapshot of one sequence on this node.
#[derive(Debug, Clone)]
pub struct SequenceStatus {
    pub sequence: String,
    pub state: &'static str,
    /// The locally-owned chunk, when in the owned state.
    pub chunk: Option<SequenceChunk>,
    /// Values left in the owned chunk.
    pub remaining: u64,
}

pub(crate) enum SequenceCommand {
    NextValue {
        sequence: String,
        reply: oneshot::Sender<Result<u64, SequenceError>>,
    },
    Status {
        sequence: String,
        reply: oneshot::Sender<SequenceStatus>,
    },
    Vote {
        from: NodeIdentity,
        vote: Vote,
    },
    Claim {
        chunk: SequenceChunk,
    },
}

/// Cheap cloneable handle to the coordinator task.
#[derive(Clone)]
pub struct SequenceHandle {
    tx: mpsc::Sender<SequenceCommand>,
}

impl SequenceHandle {
    /// Allocate the next value of a sequence.
    ///
    /// Served without peer traffic while the local chunk lasts; triggers an
    /// election otherwise and resolves once a chunk is won.
    pub async fn next_value(&self, sequence: &str) -> Result<u64, SequenceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SequenceCommand::NextValue {
                sequence: sequence.to_string(),
                reply,
            })
            .await
            .map_err(|_| SequenceError::Shutdown)?;
        rx.await.map_err(|_| SequenceError::Shutdown)?
    }

    pub async fn status(&self, sequence: &str) -> Result<SequenceStatus, SequenceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SequenceCommand::Status {
                sequence: sequence.to_string(),
                reply,
            })
            .await
            .map_err(|_| SequenceError::Shutdown)?;
        rx.await.map_err(|_| SequenceError::Shutdown)
    }

    pub(crate) async fn deliver_vote(&self, from: NodeIdentity, vote: Vote) {
        let _ = self.tx.send(SequenceCommand::Vote { from, vote }).await;
    }

    pub(crate) async fn deliver_claim(&self, chunk: SequenceChunk) {
        let _ = self.tx.send(SequenceCommand::Claim { chunk }).await;
    }
}

struct ElectionRound {
    proposal: SequenceChunk,
    endorsements: HashSet<NodeIdentity>,
    deadline: Instant,
}

enum ChunkState {
    Idle,
    Electing(ElectionRound),
    Owned { chunk: SequenceChunk, next: u64 },
    Exhausted,
}

struct SequenceState {
    state: ChunkState,
    /// Highest election epoch observed for this sequence, ours or a peer's.
    epoch_seen: u64,
    /// Last-known owned range per node, kept at the furthest end seen.
    claimed: HashMap<NodeIdentity, SequenceChunk>,
    /// Open proposals, ours included.
    in_flight: HashMap<NodeIdentity, SequenceChunk>,
    pending: VecDeque<oneshot::Sender<Result<u64, SequenceError>>>,
    loaded: bool,
}

impl Default for SequenceState {
    fn default() -> Self {
        Self {
            state: ChunkState::Idle,
            epoch_seen: 0,
            claimed: HashMap::new(),
            in_flight: HashMap::new(),
            pending: VecDeque::new(),
            loaded: false,
        }
    }
}

/// First value not covered by any known claim or open proposal.
fn next_unclaimed_start(st: &SequenceState) -> u64 {
    st.claimed
        .values()
        .chain(st.in_flight.values())
        .map(|c| c.end)
        .max()
        .unwrap_or(1)
}

/// Endorsements needed to close a round early: a majority of reachable
/// voters. With no reachable peers the window expiry closes the round.
fn majority(peer_count: usize) -> usize {
    peer_count / 2 + 1
}

enum Drain {
    /// Nothing left to do, or a round is already in flight.
    Settled,
    /// Requests are queued and no chunk or round exists.
    NeedsElection,
}

pub(crate) struct SequenceCoordinator {
    node: NodeIdentity,
    bus: Arc<dyn PeerBus>,
    store: Arc<dyn ChunkStore>,
    chunk_size: u64,
    chunk_size_overrides: HashMap<String, u64>,
    window: Duration,
    rx: mpsc::Receiver<SequenceCommand>,
    sequences: HashMap<String, SequenceState>,
}

pub(crate) fn spawn(
    node: NodeIdentity,
    bus: Arc<dyn PeerBus>,
    store: Arc<dyn ChunkStore>,
    chunk_size: u64,
    chunk_size_overrides: HashMap<String, u64>,
    window: Duration,
) -> SequenceHandle {
    let (tx, rx) = mpsc::channel(128);
    let coordinator = SequenceCoordinator {
        node,
        bus,
        store,
        chunk_size,
        chunk_size_overrides,
        window,
        rx,
        sequences: HashMap::new(),
    };
    tokio::spawn(coordinator.run());
    SequenceHandle { tx }
}

impl SequenceCoordinator {
    fn chunk_size_for(&self, sequence: &str) -> u64 {
        self.chunk_size_overrides
            .get(sequence)
            .copied()
            .unwrap_or(self.chunk_size)
    }

    async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = sleep_until_or_forever(deadline) => self.close_expired().await,
            }
        }
        log::debug!("sequence coordinator for {} stopped", self.node);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sequences
            .values()
            .filter_map(|st| match &st.state {
                ChunkState::Electing(round) => Some(round.deadline),
                _ => None,
            })
            .min()
    }

    async fn handle(&mut self, cmd: SequenceCommand) {
        match cmd {
            SequenceCommand::NextValue { sequence, reply } => {
                if let Err(e) = self.ensure_loaded(&sequence).await {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.sequences
                    .get_mut(&sequence)
                    .expect("state loaded")
                    .pending
                    .push_back(reply);
                self.pump(&sequence).await;
            }
            SequenceCommand::Status { sequence, reply } => {
                let _ = reply.send(self.status(&sequence).await);
            }
            SequenceCommand::Vote { from, vote } => self.on_vote(from, vote).await,
            SequenceCommand::Claim { chunk } => self.on_claim(chunk).await,
        }
    }

    async fn ensure_loaded(&mut self, sequence: &str) -> Result<(), SequenceError> {
        if self
            .sequences
            .get(sequence)
            .map(|st| st.loaded)
            .unwrap_or(false)
        {
            return Ok(());
        }
        let persisted = self.store.load(sequence).await?;
        let node = self.node;
        let st = self.sequences.entry(sequence.to_string()).or_default();
        st.loaded = true;
        if let Some(p) = persisted {
            st.epoch_seen = st.epoch_seen.max(p.chunk.epoch);
            if p.chunk.owner == node && p.next < p.chunk.end {
                st.state = ChunkState::Owned {
                    chunk: p.chunk.clone(),
                    next: p.next,
                };
            }
            st.claimed.insert(p.chunk.owner, p.chunk);
        }
        Ok(())
    }

    /// Serve queued requests, starting elections as needed, until the queue
    /// is empty or a round is waiting on peers.
    async fn pump(&mut self, sequence: &str) {
        loop {
            match self.drain_pending(sequence).await {
                Drain::Settled => return,
                Drain::NeedsElection => {
                    if !self.start_election(sequence).await {
                        // Round is open; pending requests resolve when it
                        // closes.
                        return;
                    }
                }
            }
        }
    }

    async fn drain_pending(&mut self, sequence: &str) -> Drain {
        loop {
            let step = {
                let st = self.sequences.get_mut(sequence).expect("state loaded");
                if st.pending.is_empty() {
                    return Drain::Settled;
                }
                match &st.state {
                    ChunkState::Owned { chunk, next } if *next < chunk.end => {
                        Some(PersistedChunk {
                            chunk: chunk.clone(),
                            next: *next + 1,
                        })
                    }
                    ChunkState::Owned { .. } => {
                        st.state = ChunkState::Exhausted;
                        return Drain::NeedsElection;
                    }
                    ChunkState::Electing(_) => return Drain::Settled,
                    ChunkState::Idle | ChunkState::Exhausted => return Drain::NeedsElection,
                }
            };
            let progress = step.expect("owned state");
            let value = progress.next - 1;
            // Persist the cursor before handing the value out so a restart
            // can never re-allocate it.
            let saved = self.store.save(&progress).await;
            let st = self.sequences.get_mut(sequence).expect("state loaded");
            match saved {
                Ok(()) => {
                    let exhausted = progress.next >= progress.chunk.end;
                    if let ChunkState::Owned { next, .. } = &mut st.state {
                        *next = progress.next;
                    }
                    if exhausted {
                        st.state = ChunkState::Exhausted;
                    }
                    if let Some(reply) = st.pending.pop_front() {
                        let _ = reply.send(Ok(value));
                    }
                }
                Err(e) => {
                    log::error!("failed to persist cursor for sequence {sequence}: {e}");
                    if let Some(reply) = st.pending.pop_front() {
                        let _ = reply.send(Err(SequenceError::Store(e)));
                    }
                }
            }
        }
    }

    /// Open an election round. Returns `true` when the round closed on the
    /// spot (no reachable peers), so the caller can continue pumping.
    async fn start_election(&mut self, sequence: &str) -> bool {
        let node = self.node;
        let chunk_size = self.chunk_size_for(sequence);
        let vote = {
            let st = self.sequences.get_mut(sequence).expect("state loaded");
            if matches!(st.state, ChunkState::Electing(_)) {
                return false;
            }
            let epoch = st.epoch_seen + 1;
            st.epoch_seen = epoch;
            let start = next_unclaimed_start(st);
            let proposal = SequenceChunk {
                sequence: sequence.to_string(),
                start,
                end: start + chunk_size,
                owner: node,
                epoch,
            };
            st.in_flight.insert(node, proposal.clone());
            st.state = ChunkState::Electing(ElectionRound {
                proposal: proposal.clone(),
                endorsements: HashSet::new(),
                deadline: Instant::now() + self.window,
            });
            Vote {
                epoch,
                chunk: proposal,
                voter: node,
            }
        };
        log::info!(
            "{node} proposing chunk [{}, {}) of sequence {sequence} in epoch {}",
            vote.chunk.start,
            vote.chunk.end,
            vote.epoch,
        );
        if let Err(e) = self
            .bus
            .broadcast(node, PeerMessage::SequenceVote(vote))
            .await
        {
            log::warn!("failed to broadcast sequence proposal: {e}");
        }
        if self.bus.peers(node).is_empty() {
            self.finish_round(sequence).await;
            return true;
        }
        false
    }

    /// Close the open round as won: persist the chunk, take ownership, and
    /// announce the claim.
    async fn finish_round(&mut self, sequence: &str) {
        let chunk = {
            let st = self.sequences.get_mut(sequence).expect("state loaded");
            let ChunkState::Electing(round) = &st.state else {
                return;
            };
            round.proposal.clone()
        };
        let progress = PersistedChunk {
            chunk: chunk.clone(),
            next: chunk.start,
        };
        if let Err(e) = self.store.save(&progress).await {
            log::error!("failed to persist won chunk for sequence {sequence}: {e}");
            let st = self.sequences.get_mut(sequence).expect("state loaded");
            st.state = ChunkState::Idle;
            st.in_flight.remove(&self.node);
            while let Some(reply) = st.pending.pop_front() {
                let _ = reply.send(Err(SequenceError::Store(e.clone())));
            }
            return;
        }
        {
            let st = self.sequences.get_mut(sequence).expect("state loaded");
            st.claimed.insert(self.node, chunk.clone());
            st.in_flight.remove(&self.node);
            st.state = ChunkState::Owned {
                chunk: chunk.clone(),
                next: chunk.start,
            };
        }
        log::info!(
            "{} won chunk [{}, {}) of sequence {sequence} in epoch {}",
            self.node,
            chunk.start,
            chunk.end,
            chunk.epoch,
        );
        if let Err(e) = self
            .bus
            .broadcast(self.node, PeerMessage::SequenceClaim(chunk))
            .await
        {
            log::warn!("failed to announce chunk claim: {e}");
        }
    }

    async fn close_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sequences
            .iter()
            .filter_map(|(name, st)| match &st.state {
                ChunkState::Electing(round) if round.deadline <= now => Some(name.clone()),
                _ => None,
            })
            .collect();
        for sequence in expired {
            // The window closed; whatever votes arrived decide the round.
            self.finish_round(&sequence).await;
            self.pump(&sequence).await;
        }
    }

    async fn on_vote(&mut self, from: NodeIdentity, vote: Vote) {
        let sequence = vote.chunk.sequence.clone();
        if let Err(e) = self.ensure_loaded(&sequence).await {
            log::warn!("ignoring vote for sequence {sequence}: {e}");
            return;
        }
        let peer_count = self.bus.peers(self.node).len();
        let node = self.node;

        if vote.voter == vote.chunk.owner {
            // A proposal from a peer.
            enum Reaction {
                LoseTie(SequenceChunk),
                /// Answer with a competing proposal; the peer applies the
                /// same tie-break and backs off.
                Counter(SequenceChunk),
                /// Answer with a settled claim covering the range.
                Claimed(SequenceChunk),
                Endorse(SequenceChunk),
            }
            let reaction = {
                let st = self.sequences.get_mut(&sequence).expect("state loaded");
                st.epoch_seen = st.epoch_seen.max(vote.epoch);
                st.in_flight.insert(vote.chunk.owner, vote.chunk.clone());

                let own_tie = match &st.state {
                    ChunkState::Electing(round) if round.proposal.overlaps(&vote.chunk) => {
                        if vote.chunk.owner.sysid < node.sysid {
                            Some(Reaction::LoseTie(vote.chunk.clone()))
                        } else {
                            Some(Reaction::Counter(round.proposal.clone()))
                        }
                    }
                    _ => None,
                };
                match own_tie {
                    Some(reaction) => reaction,
                    None => {
                        // Not our fight: apply the same rules as a
                        // bystander, so two competing proposers can never
                        // both collect a majority from nodes with no stake.
                        if let Some(existing) = st
                            .claimed
                            .values()
                            .find(|c| c.overlaps(&vote.chunk))
                        {
                            Reaction::Claimed(existing.clone())
                        } else if let Some(better) = st.in_flight.values().find(|c| {
                            c.overlaps(&vote.chunk)
                                && c.owner.sysid < vote.chunk.owner.sysid
                        }) {
                            Reaction::Counter(better.clone())
                        } else {
                            Reaction::Endorse(vote.chunk.clone())
                        }
                    }
                }
            };
            match reaction {
                Reaction::LoseTie(theirs) => {
                    log::debug!(
                        "{node} lost sequence tie for {sequence} to {}, re-proposing",
                        theirs.owner,
                    );
                    let endorse = Vote {
                        epoch: theirs.epoch,
                        chunk: theirs,
                        voter: node,
                    };
                    let _ = self
                        .bus
                        .send(node, from, PeerMessage::SequenceVote(endorse))
                        .await;
                    {
                        let st = self.sequences.get_mut(&sequence).expect("state loaded");
                        st.state = ChunkState::Idle;
                        st.in_flight.remove(&node);
                    }
                    // Losers re-propose immediately; the next range is
                    // beyond the winner's, so both make progress.
                    if self.start_election(&sequence).await {
                        self.pump(&sequence).await;
                    }
                }
                Reaction::Counter(winner) => {
                    let counter = Vote {
                        epoch: winner.epoch,
                        voter: winner.owner,
                        chunk: winner,
                    };
                    let _ = self
                        .bus
                        .send(node, from, PeerMessage::SequenceVote(counter))
                        .await;
                }
                Reaction::Claimed(chunk) => {
                    let _ = self
                        .bus
                        .send(node, from, PeerMessage::SequenceClaim(chunk))
                        .await;
                }
                Reaction::Endorse(theirs) => {
                    let endorse = Vote {
                        epoch: theirs.epoch,
                        chunk: theirs,
                        voter: node,
                    };
                    let _ = self
                        .bus
                        .send(node, from, PeerMessage::SequenceVote(endorse))
                        .await;
                }
            }
        } else if vote.chunk.owner == node {
            // An endorsement of our proposal.
            let won = {
                let st = self.sequences.get_mut(&sequence).expect("state loaded");
                st.epoch_seen = st.epoch_seen.max(vote.epoch);
                match &mut st.state {
                    ChunkState::Electing(round) if round.proposal == vote.chunk => {
                        round.endorsements.insert(vote.voter);
                        round.endorsements.len() >= majority(peer_count)
                    }
                    _ => false,
                }
            };
            if won {
                self.finish_round(&sequence).await;
                self.pump(&sequence).await;
            }
        }
    }

    async fn on_claim(&mut self, chunk: SequenceChunk) {
        let sequence = chunk.sequence.clone();
        if let Err(e) = self.ensure_loaded(&sequence).await {
            log::warn!("ignoring claim for sequence {sequence}: {e}");
            return;
        }
        let lost = {
            let st = self.sequences.get_mut(&sequence).expect("state loaded");
            st.epoch_seen = st.epoch_seen.max(chunk.epoch);
            st.in_flight.remove(&chunk.owner);
            match st.claimed.get(&chunk.owner) {
                Some(existing) if existing.end >= chunk.end => {}
                _ => {
                    st.claimed.insert(chunk.owner, chunk.clone());
                }
            }
            matches!(&st.state, ChunkState::Electing(round) if round.proposal.overlaps(&chunk))
        };
        if lost {
            log::debug!(
                "{} proposal for {sequence} overlaps a settled claim by {}, re-proposing",
                self.node,
                chunk.owner,
            );
            {
                let st = self.sequences.get_mut(&sequence).expect("state loaded");
                st.state = ChunkState::Idle;
                st.in_flight.remove(&self.node);
            }
            if self.start_election(&sequence).await {
                self.pump(&sequence).await;
            }
        }
    }

    async fn status(&mut self, sequence: &str) -> SequenceStatus {
        if let Err(e) = self.ensure_loaded(sequence).await {
            log::warn!("status load for sequence {sequence} failed: {e}");
        }
        let st = self.sequences.entry(sequence.to_string()).or_default();
        let (state, chunk, remaining) = match &st.state {
            ChunkState::Idle => ("idle", None, 0),
            ChunkState::Electing(_) => ("electing", None, 0),
            ChunkState::Owned { chunk, next } => ("owned", Some(chunk.clone()), chunk.end - next),
            ChunkState::Exhausted => ("exhausted", None, 0),
        };
        SequenceStatus {
            sequence: sequence.to_string(),
            state,
            chunk,
            remaining,
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
