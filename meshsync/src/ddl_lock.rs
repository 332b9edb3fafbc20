//! Global DDL lock.
//!
//! Schema changes must be serialized cluster-wide even though every node
//! accepts writes independently. Acquisition is itself replicated: the
//! requester broadcasts a [`LockRequest`](crate::messages::PeerMessage),
//! every peer queues it and acknowledges (or explicitly defers when it
//! holds the lock or knows an earlier request), and the requester treats
//! the lock as granted only once every reachable peer has answered **and**
//! its request heads the queue.
//!
//! Queues are ordered by `(counter, node identity)`, where the counter is
//! monotonically increasing and seeded at cluster join, so the order is
//! globally comparable without clock synchronization and at most one node
//! can head the queue at a time. Releases broadcast; every node removes the
//! released entry and the new head grants itself.
//!
//! An unreachable peer bounds an acquire, it does not wedge it: the ack
//! window is retried with backoff until the configured timeout, after which
//! the request is withdrawn with a release broadcast. Fencing a crashed
//! holder is the liveness collaborator's job, outside this crate.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::bus::PeerBus;
use crate::identity::NodeIdentity;
use crate::messages::{LockMode, PeerMessage};

#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error("lock acquisition timed out")]
    Timeout,
    #[error("lock coordinator shut down")]
    Shutdown,
    #[error("this node does not hold the lock")]
    NotHolder,
    #[error("an acquisition is already in flight on this node")]
    AlreadyQueued,
}

/// Operator-visible lock state.
#[derive(Debug, Clone)]
pub struct DdlLockStatus {
    /// Head of the request queue: the holder, or the requester about to be
    /// granted once its acks complete.
    pub holder: Option<NodeIdentity>,
    pub mode: Option<LockMode>,
    /// Remaining queued requesters, in grant order.
    pub queue: Vec<NodeIdentity>,
    /// Whether the local node currently holds the lock.
    pub held_locally: bool,
}

pub(crate) enum LockCommand {
    Acquire {
        mode: LockMode,
        reply: oneshot::Sender<Result<(), LockError>>,
    },
    Release {
        reply: oneshot::Sender<Result<(), LockError>>,
    },
    Status {
        reply: oneshot::Sender<DdlLockStatus>,
    },
    Inbound {
        from: NodeIdentity,
        msg: PeerMessage,
    },
}

/// Cheap cloneable handle to the lock coordinator task.
#[derive(Clone)]
pub struct DdlLockHandle {
    tx: mpsc::Sender<LockCommand>,
}

impl DdlLockHandle {
    /// Acquire the global lock, waiting until granted or the configured
    /// timeout elapses.
    pub async fn acquire(&self, mode: LockMode) -> Result<(), LockError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LockCommand::Acquire { mode, reply })
            .await
            .map_err(|_| LockError::Shutdown)?;
        rx.await.map_err(|_| LockError::Shutdown)?
    }

    /// Release the lock after the statement's replicated effects are
    /// durable.
    pub async fn release(&self) -> Result<(), LockError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LockCommand::Release { reply })
            .await
            .map_err(|_| LockError::Shutdown)?;
        rx.await.map_err(|_| LockError::Shutdown)?
    }

    pub async fn status(&self) -> Result<DdlLockStatus, LockError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LockCommand::Status { reply })
            .await
            .map_err(|_| LockError::Shutdown)?;
        rx.await.map_err(|_| LockError::Shutdown)
    }

    pub(crate) async fn deliver(&self, from: NodeIdentity, msg: PeerMessage) {
        let _ = self.tx.send(LockCommand::Inbound { from, msg }).await;
    }
}

/// Our in-flight acquisition.
///
/// `acks` keeps each peer's latest answer: `false` is a clean ack, `true` a
/// deferral (the peer holds the lock or knows an earlier request). Deferrals
/// clear when the blocking request releases and the peer re-acks the new
/// queue head.
struct PendingAcquire {
    key: (u64, NodeIdentity),
    acks: HashMap<NodeIdentity, bool>,
    reply: oneshot::Sender<Result<(), LockError>>,
    started: Instant,
    next_retry: Instant,
}

pub(crate) struct DdlLockCoordinator {
    node: NodeIdentity,
    bus: Arc<dyn PeerBus>,
    timeout: Duration,
    backoff: Duration,
    rx: mpsc::Receiver<LockCommand>,
    /// Next request counter; seeded at cluster join.
    counter: u64,
    /// All known requests, ordered by `(counter, requester)`.
    queue: BTreeMap<(u64, NodeIdentity), LockMode>,
    /// Set when the local node granted itself the lock.
    held_key: Option<(u64, NodeIdentity)>,
    pending: Option<PendingAcquire>,
}

pub(crate) fn spawn(
    node: NodeIdentity,
    bus: Arc<dyn PeerBus>,
    join_counter: u64,
    timeout: Duration,
    backoff: Duration,
) -> DdlLockHandle {
    let (tx, rx) = mpsc::channel(128);
    let coordinator = DdlLockCoordinator {
        node,
        bus,
        timeout,
        backoff,
        rx,
        counter: join_counter,
        queue: BTreeMap::new(),
        held_key: None,
        pending: None,
    };
    tokio::spawn(coordinator.run());
    DdlLockHandle { tx }
}

impl DdlLockCoordinator {
    async fn run(mut self) {
        loop {
            let retry_at = self.pending.as_ref().map(|p| p.next_retry);
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = sleep_until_or_forever(retry_at) => self.retry_pending().await,
            }
        }
        log::debug!("ddl lock coordinator for {} stopped", self.node);
    }

    async fn handle(&mut self, cmd: LockCommand) {
        match cmd {
            LockCommand::Acquire { mode, reply } => self.acquire(mode, reply).await,
            LockCommand::Release { reply } => {
                let _ = reply.send(self.release().await);
            }
            LockCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            LockCommand::Inbound { from, msg } => self.on_message(from, msg).await,
        }
    }

    async fn acquire(&mut self, mode: LockMode, reply: oneshot::Sender<Result<(), LockError>>) {
        if self.pending.is_some() || self.held_key.is_some() {
            let _ = reply.send(Err(LockError::AlreadyQueued));
            return;
        }
        self.counter += 1;
        let key = (self.counter, self.node);
        self.queue.insert(key, mode);
        let now = Instant::now();
        self.pending = Some(PendingAcquire {
            key,
            acks: HashMap::new(),
            reply,
            started: now,
            next_retry: now + self.backoff,
        });
        log::info!(
            "{} requesting global ddl lock (counter {}, mode {mode:?})",
            self.node,
            key.0,
        );
        self.broadcast_request(key.0, mode).await;
        self.maybe_grant();
    }

    async fn broadcast_request(&self, counter: u64, mode: LockMode) {
        let msg = PeerMessage::LockRequest {
            requester: self.node,
            counter,
            mode,
        };
        if let Err(e) = self.bus.broadcast(self.node, msg).await {
            log::warn!("failed to broadcast lock request: {e}");
        }
    }

    async fn release(&mut self) -> Result<(), LockError> {
        let Some(key) = self.held_key.take() else {
            return Err(LockError::NotHolder);
        };
        self.queue.remove(&key);
        log::info!("{} releasing global ddl lock (counter {})", self.node, key.0);
        let msg = PeerMessage::LockRelease {
            holder: self.node,
            counter: key.0,
        };
        if let Err(e) = self.bus.broadcast(self.node, msg).await {
            log::warn!("failed to broadcast lock release: {e}");
        }
        // A queued remote request may head the queue now; hand it a clean
        // ack so the deferral from our hold clears.
        self.refresh_head().await;
        Ok(())
    }

    async fn on_message(&mut self, from: NodeIdentity, msg: PeerMessage) {
        match msg {
            PeerMessage::LockRequest {
                requester,
                counter,
                mode,
            } => {
                let key = (counter, requester);
                self.queue.insert(key, mode);
                // Defer when we hold the lock or know an earlier request;
                // either way the request is queued and acknowledged.
                let deferred =
                    self.held_key.is_some() || self.queue.range(..key).next().is_some();
                let ack = PeerMessage::LockAck {
                    from: self.node,
                    requester,
                    counter,
                    deferred,
                };
                if let Err(e) = self.bus.send(self.node, from, ack).await {
                    log::warn!("failed to ack lock request from {from}: {e}");
                }
            }
            PeerMessage::LockAck {
                from: acker,
                requester,
                counter,
                deferred,
            } => {
                if requester != self.node {
                    return;
                }
                let mut acked = false;
                if let Some(pending) = &mut self.pending {
                    if pending.key.0 == counter {
                        pending.acks.insert(acker, deferred);
                        acked = true;
                    }
                }
                if acked {
                    log::debug!(
                        "{} lock ack from {acker} (deferred: {deferred})",
                        self.node,
                    );
                    self.maybe_grant();
                }
            }
            PeerMessage::LockRelease { holder, counter } => {
                self.queue.remove(&(counter, holder));
                // The release may have unblocked the queue head: re-ack a
                // remote head so its stale deferrals clear, or grant
                // ourselves.
                self.refresh_head().await;
            }
            other => {
                log::debug!("lock coordinator ignoring {other:?} from {from}");
            }
        }
    }

    /// After a queue change, push the new head forward: re-ack a remote
    /// head (its deferrals from before the release are stale) or try to
    /// grant ourselves.
    async fn refresh_head(&mut self) {
        let head = self
            .queue
            .iter()
            .next()
            .map(|((counter, requester), _)| (*counter, *requester));
        match head {
            Some((_, requester)) if requester == self.node => self.maybe_grant(),
            Some((counter, requester)) => {
                let ack = PeerMessage::LockAck {
                    from: self.node,
                    requester,
                    counter,
                    deferred: self.held_key.is_some(),
                };
                if let Err(e) = self.bus.send(self.node, requester, ack).await {
                    log::warn!("failed to re-ack lock head {requester}: {e}");
                }
            }
            None => {}
        }
    }

    /// Grant ourselves the lock once every reachable peer's latest answer
    /// is a clean ack and our request heads the queue. Queue order is
    /// identical on every node, so at most one node can pass the head
    /// check; a peer that still holds the lock keeps its ack deferred,
    /// which blocks a lower-counter latecomer from jumping the grant.
    fn maybe_grant(&mut self) {
        let Some(pending) = &self.pending else {
            return;
        };
        let peers = self.bus.peers(self.node);
        let all_clean = peers
            .iter()
            .all(|peer| pending.acks.get(peer) == Some(&false));
        let at_head = self.queue.keys().next() == Some(&pending.key);
        if all_clean && at_head {
            let pending = self.pending.take().expect("pending checked above");
            self.held_key = Some(pending.key);
            log::info!(
                "{} granted global ddl lock (counter {})",
                self.node,
                pending.key.0,
            );
            let _ = pending.reply.send(Ok(()));
        }
    }

    async fn retry_pending(&mut self) {
        let now = Instant::now();
        let (key, timed_out) = match &self.pending {
            Some(pending) => (
                pending.key,
                now.duration_since(pending.started) >= self.timeout,
            ),
            None => return,
        };
        if timed_out {
            // Withdraw so peers do not keep a dead request queued ahead of
            // later ones.
            let pending = self.pending.take().expect("pending checked above");
            self.queue.remove(&key);
            log::warn!(
                "{} withdrawing global ddl lock request (counter {}) after timeout",
                self.node,
                key.0,
            );
            let msg = PeerMessage::LockRelease {
                holder: self.node,
                counter: key.0,
            };
            if let Err(e) = self.bus.broadcast(self.node, msg).await {
                log::warn!("failed to broadcast lock withdrawal: {e}");
            }
            let _ = pending.reply.send(Err(LockError::Timeout));
            self.refresh_head().await;
            return;
        }
        if let Some(pending) = &mut self.pending {
            pending.next_retry = now + self.backoff;
        }
        let mode = *self.queue.get(&key).expect("own request queued");
        log::debug!(
            "{} re-broadcasting lock request (counter {})",
            self.node,
            key.0,
        );
        self.broadcast_request(key.0, mode).await;
        self.maybe_grant();
    }

    fn status(&self) -> DdlLockStatus {
        let mut entries = self.queue.iter();
        let head = entries.next();
        DdlLockStatus {
            holder: head.map(|((_, node), _)| *node),
            mode: head.map(|(_, mode)| *mode),
            queue: entries.map(|((_, node), _)| *node).collect(),
            held_locally: self.held_key.is_some(),
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;

    fn node(sysid: u64) -> NodeIdentity {
        NodeIdentity::new(sysid, 1, 1)
    }

    #[tokio::test]
    async fn test_single_node_grants_immediately() {
        let bus = LocalBus::new();
        let _rx = bus.attach(node(1));
        let handle = spawn(
            node(1),
            bus,
            0,
            Duration::from_secs(1),
            Duration::from_millis(20),
        );
        handle.acquire(LockMode::Ddl).await.unwrap();
        let status = handle.status().await.unwrap();
        assert!(status.held_locally);
        assert_eq!(status.holder, Some(node(1)));
        handle.release().await.unwrap();
        assert!(!handle.status().await.unwrap().held_locally);
    }

    #[tokio::test]
    async fn test_release_without_hold_is_an_error() {
        let bus = LocalBus::new();
        let _rx = bus.attach(node(1));
        let handle = spawn(
            node(1),
            bus,
            0,
            Duration::from_secs(1),
            Duration::from_millis(20),
        );
        assert!(matches!(
            handle.release().await,
            Err(LockError::NotHolder)
        ));
    }

    #[tokio::test]
    async fn test_double_acquire_is_rejected() {
        let bus = LocalBus::new();
        let _rx = bus.attach(node(1));
        let handle = spawn(
            node(1),
            bus,
            0,
            Duration::from_secs(1),
            Duration::from_millis(20),
        );
        handle.acquire(LockMode::Ddl).await.unwrap();
        assert!(matches!(
            handle.acquire(LockMode::Ddl).await,
            Err(LockError::AlreadyQueued)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_peer_times_out_acquire() {
        let bus = LocalBus::new();
        let _rx = bus.attach(node(1));
        // A second peer is attached but its coordinator never runs, so no
        // ack ever arrives.
        let _silent = bus.attach(node(2));
        let handle = spawn(
            node(1),
            bus,
            0,
            Duration::from_millis(100),
            Duration::from_millis(20),
        );
        let result = handle.acquire(LockMode::Ddl).await;
        assert!(matches!(result, Err(LockError::Timeout)));
        // The withdrawn request is gone from the local queue.
        let status = handle.status().await.unwrap();
        assert_eq!(status.holder, None);
        assert!(status.queue.is_empty());
    }
}
