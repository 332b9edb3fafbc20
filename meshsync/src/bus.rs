//! Peer messaging seam.
//!
//! The coordination loops talk to each other through a [`PeerBus`]: fire and
//! forget broadcast/unicast of [`PeerMessage`] values addressed by
//! [`NodeIdentity`]. The substrate promises per-peer-pair delivery order and
//! nothing else; both control loops tolerate lost messages.
//!
//! [`LocalBus`] is the in-process implementation used by tests and embedded
//! single-process clusters; a real deployment puts its transport behind the
//! same trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::identity::NodeIdentity;
use crate::messages::{Envelope, PeerMessage};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("peer {0} is not attached")]
    UnknownPeer(NodeIdentity),
}

/// Inter-node messaging substrate.
#[async_trait]
pub trait PeerBus: Send + Sync {
    /// Attach a node and return its inbound message stream. Re-attaching
    /// replaces the previous stream.
    fn attach(&self, node: NodeIdentity) -> mpsc::Receiver<Envelope>;

    /// Detach a node; messages to it are dropped from now on.
    fn detach(&self, node: NodeIdentity);

    /// Nodes currently reachable from `node`'s point of view, excluding
    /// `node` itself. Voting majorities and lock-ack accounting are computed
    /// against this set.
    fn peers(&self, node: NodeIdentity) -> Vec<NodeIdentity>;

    /// Send to every reachable peer. Unreachable peers are skipped, not an
    /// error.
    async fn broadcast(&self, from: NodeIdentity, msg: PeerMessage) -> Result<(), BusError>;

    /// Send to one peer.
    async fn send(
        &self,
        from: NodeIdentity,
        to: NodeIdentity,
        msg: PeerMessage,
    ) -> Result<(), BusError>;
}

const CHANNEL_CAPACITY: usize = 256;

/// In-process [`PeerBus`] over tokio channels.
#[derive(Default)]
pub struct LocalBus {
    nodes: Mutex<HashMap<NodeIdentity, mpsc::Sender<Envelope>>>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sender(&self, to: NodeIdentity) -> Option<mpsc::Sender<Envelope>> {
        self.nodes.lock().unwrap().get(&to).cloned()
    }
}

#[async_trait]
impl PeerBus for LocalBus {
    fn attach(&self, node: NodeIdentity) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.nodes.lock().unwrap().insert(node, tx);
        rx
    }

    fn detach(&self, node: NodeIdentity) {
        self.nodes.lock().unwrap().remove(&node);
    }

    fn peers(&self, node: NodeIdentity) -> Vec<NodeIdentity> {
        self.nodes
            .lock()
            .unwrap()
            .keys()
            .filter(|id| **id != node)
            .copied()
            .collect()
    }

    async fn broadcast(&self, from: NodeIdentity, msg: PeerMessage) -> Result<(), BusError> {
        let targets: Vec<(NodeIdentity, mpsc::Sender<Envelope>)> = {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .iter()
                .filter(|(id, _)| **id != from)
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        let sends = targets.into_iter().map(|(to, tx)| {
            let envelope = Envelope {
                from,
                msg: msg.clone(),
            };
            async move {
                if tx.send(envelope).await.is_err() {
                    log::debug!("dropping message for detached peer {to}");
                }
            }
        });
        futures::future::join_all(sends).await;
        Ok(())
    }

    async fn send(
        &self,
        from: NodeIdentity,
        to: NodeIdentity,
        msg: PeerMessage,
    ) -> Result<(), BusError> {
        let tx = self.sender(to).ok_or(BusError::UnknownPeer(to))?;
        if tx.send(Envelope { from, msg }).await.is_err() {
            log::debug!("dropping message for detached peer {to}");
        }
        Ok(())
    }
}
