//! # Summary
//!
//! This module implements a central hub for message routing inside one
//! replica. The hub owns the transmitting halves of every mailbox: the
//! collocated consensus module and replica, one channel per connected
//! peer, and one channel per connected client. It is wrapped in
//! `Arc<RwLock>` so connection actors can register and deregister
//! themselves while the core actors route through it.
//!
//! Mailboxes are plain `futures::sync::mpsc` unbounded channels; the
//! only way for a send to fail is a dropped receiver. Which sends may
//! fail is a routing decision made here: the consensus and replica
//! mailboxes must outlive the hub, so losing one is a fatal wiring error
//! and the send panics, taking the whole replica down with the dead
//! component. Peers and clients disconnect whenever they like, so those
//! sends just drop the message, like the lossy network would have.

use std::collections::HashMap as Map;
use std::sync::Arc;

use futures::sync::mpsc;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::message;
use crate::state;
use crate::thread::{consensus, peer, replica};

/// Thread-safe handle on the routing hub.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct Shared<S: state::State>(Arc<RwLock<Hub<S>>>);

impl<S: state::State> Shared<S> {
    /// Initializes a hub routing to the given core mailboxes.
    pub fn new(
        id: usize,
        consensus_tx: mpsc::UnboundedSender<consensus::In<S::Command>>,
        replica_tx: mpsc::UnboundedSender<replica::In<S::Command>>,
    ) -> Self {
        Shared(Arc::new(RwLock::new(Hub::new(id, consensus_tx, replica_tx))))
    }

    /// Acquires a read lock on the underlying hub.
    pub fn read(&self) -> RwLockReadGuard<Hub<S>> {
        self.0.read()
    }

    /// Acquires a write lock on the underlying hub.
    pub fn write(&self) -> RwLockWriteGuard<Hub<S>> {
        self.0.write()
    }
}

/// Routing table of transmitting channels.
pub struct Hub<S: state::State> {
    id: usize,
    peer_txs: Map<usize, mpsc::UnboundedSender<peer::In<S::Command>>>,
    client_txs: Map<<S::Command as state::Command>::ClientID, mpsc::UnboundedSender<message::Reply<S::Response>>>,
    consensus_tx: mpsc::UnboundedSender<consensus::In<S::Command>>,
    replica_tx: mpsc::UnboundedSender<replica::In<S::Command>>,
}

impl<S: state::State> Hub<S> {
    fn new(
        id: usize,
        consensus_tx: mpsc::UnboundedSender<consensus::In<S::Command>>,
        replica_tx: mpsc::UnboundedSender<replica::In<S::Command>>,
    ) -> Self {
        Hub {
            id,
            peer_txs: Map::default(),
            client_txs: Map::default(),
            consensus_tx,
            replica_tx,
        }
    }

    /// Registers the provided peer channel with this hub.
    pub fn connect_peer(&mut self, id: usize, tx: mpsc::UnboundedSender<peer::In<S::Command>>) {
        self.peer_txs.insert(id, tx);
    }

    /// Disconnects the provided peer from this hub.
    pub fn disconnect_peer(&mut self, id: usize) {
        self.peer_txs.remove(&id);
    }

    /// Registers the provided client channel with this hub.
    pub fn connect_client(
        &mut self,
        id: <S::Command as state::Command>::ClientID,
        tx: mpsc::UnboundedSender<message::Reply<S::Response>>,
    ) {
        self.client_txs.insert(id, tx);
    }

    /// Disconnects the provided client from this hub.
    pub fn disconnect_client(&mut self, id: &<S::Command as state::Command>::ClientID) {
        self.client_txs.remove(id);
    }

    /// Forwards a message to the collocated consensus module.
    pub fn send_consensus(&self, message: consensus::In<S::Command>) {
        self.consensus_tx.unbounded_send(message)
            .expect("[INTERNAL ERROR]: consensus module is gone");
    }

    /// Forwards a message to the collocated replica.
    pub fn send_replica(&self, message: replica::In<S::Command>) {
        self.replica_tx.unbounded_send(message)
            .expect("[INTERNAL ERROR]: replica is gone");
    }

    /// Forwards a reply to an external client. Dropped silently unless the
    /// client is connected to this replica: only the replica that proposed
    /// a command answers for it.
    pub fn send_client(
        &self,
        id: <S::Command as state::Command>::ClientID,
        message: message::Reply<S::Response>,
    ) {
        if let Some(tx) = self.client_txs.get(&id) {
            tx.unbounded_send(message).ok();
        }
    }

    /// Sends a message to the replica with the given id. Messages to
    /// ourselves skip the network and land directly in the consensus
    /// mailbox, so a proposer's own acceptor votes like any other.
    pub fn send(&self, id: usize, message: peer::In<S::Command>) {
        if id == self.id {
            self.forward(message);
        } else if let Some(tx) = self.peer_txs.get(&id) {
            tx.unbounded_send(message).ok();
        }
    }

    /// Routes an inbound peer message to the consensus mailbox.
    pub fn forward(&self, message: peer::In<S::Command>) {
        match message {
        | peer::In::Prepare(m) => self.send_consensus(consensus::In::Prepare(m)),
        | peer::In::Prepared(m) => self.send_consensus(consensus::In::Prepared(m)),
        | peer::In::Accept(m) => self.send_consensus(consensus::In::Accept(m)),
        | peer::In::Accepted(m) => self.send_consensus(consensus::In::Accepted(m)),
        | peer::In::Nack(m) => self.send_consensus(consensus::In::Nack(m)),
        | peer::In::Decide(m) => self.send_consensus(consensus::In::Decide(m)),
        | peer::In::Ping(_) => (),
        }
    }

    /// Sends a message to every replica, this one included.
    pub fn broadcast(&self, message: peer::In<S::Command>) {
        for tx in self.peer_txs.values() {
            tx.unbounded_send(message.clone()).ok();
        }
        self.forward(message);
    }
}
