//! # Summary
//!
//! This module defines external connections to other replicas.
//! Responsible for forwarding messages to and from connected peers.

use futures::sync::mpsc;
use serde_derive::{Deserialize, Serialize};
use tokio::net;
use tokio::prelude::*;

use crate::message;
use crate::shared::Shared;
use crate::socket;
use crate::state;

/// Peer replicas exchange the single-decree Paxos messages for each
/// instance, plus pings to identify and keep connections.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
#[derive(Clone, Debug)]
pub enum In<C: state::Command> {
    Prepare(message::Prepare),
    Prepared(message::Prepared<C>),
    Accept(message::Accept<C>),
    Accepted(message::Accepted),
    Nack(message::Nack),
    Decide(message::Decide<C>),
    Ping(usize),
}

/// Represents a peer that has not yet sent a ping, so we don't know its ID.
pub struct Connecting<S: state::State> {
    /// ID of the current replica (not the peer)
    self_id: usize,

    /// External connection to the peer
    link: Option<socket::Link<In<S::Command>, In<S::Command>>>,

    /// Intra-server shared transmitting channels
    shared_tx: Option<Shared<S>>,

    /// Ping interval for detecting failed connections
    timeout: std::time::Duration,
}

impl<S: state::State> Connecting<S> {
    pub fn new(
        self_id: usize,
        stream: net::TcpStream,
        shared_tx: Shared<S>,
        timeout: std::time::Duration,
    ) -> Self {
        Connecting {
            self_id,
            link: Some(socket::Link::new(stream)),
            shared_tx: Some(shared_tx),
            timeout,
        }
    }
}

impl<S: state::State> Future for Connecting<S> {
    type Item = Peer<S>;
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        while let Async::Ready(Some(message)) = self.link.as_mut().unwrap().poll_recv()? {
            match message {
            | In::Ping(peer_id) => {
                // The first ping carries the connected replica's ID: we
                // can register it with the hub and promote the connection
                // to a Peer. Safe to unwrap here because we always
                // initialize with Some and always return after moving out
                // of the options.
                info!("connected to {}", peer_id);
                let (tx, rx) = mpsc::unbounded();
                self.shared_tx.as_mut()
                    .unwrap()
                    .write()
                    .connect_peer(peer_id, tx);
                return Ok(Async::Ready(Peer {
                    peer_id,
                    self_id: self.self_id,
                    rx,
                    link: self.link.take().unwrap(),
                    shared_tx: self.shared_tx.take().unwrap(),
                    timeout: tokio::timer::Interval::new_interval(self.timeout),
                }))
            }
            | message => self.shared_tx.as_ref().unwrap().read().forward(message),
            }
        }
        Ok(Async::NotReady)
    }
}

/// Represents a peer replica with known ID that is registered with the
/// shared transmission hub.
pub struct Peer<S: state::State> {
    /// ID of connected replica
    peer_id: usize,

    /// ID of this replica, sent in pings
    self_id: usize,

    /// Intra-server receiving channel
    rx: mpsc::UnboundedReceiver<In<S::Command>>,

    /// External connection to the peer
    link: socket::Link<In<S::Command>, In<S::Command>>,

    /// Intra-server shared transmitting channels
    shared_tx: Shared<S>,

    /// Ping interval for detecting failed connections
    timeout: tokio::timer::Interval,
}

impl<S: state::State> Peer<S> {
    pub fn new(
        self_id: usize,
        peer_id: usize,
        stream: net::TcpStream,
        shared_tx: Shared<S>,
        timeout: std::time::Duration,
    ) -> Result<Self, ()> {
        let mut link = socket::Link::new(stream);
        let (tx, rx) = mpsc::unbounded();

        // Identify ourselves so the other end can register this
        // connection under our ID.
        link.send(In::Ping(self_id))?;
        shared_tx.write().connect_peer(peer_id, tx);
        info!("connected to {}", peer_id);

        Ok(Peer {
            peer_id,
            self_id,
            rx,
            link,
            shared_tx,
            timeout: tokio::timer::Interval::new_interval(timeout),
        })
    }
}

impl<S: state::State> Future for Peer<S> {
    type Item = ();
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {

        // Keep the connection identified on the other end
        while let Async::Ready(Some(_)) = self.timeout.poll().map_err(|_| ())? {
            self.link.send(In::Ping(self.self_id))?;
        }

        // Forward incoming messages
        while let Async::Ready(Some(message)) = self.link.poll_recv()? {
            if let In::Ping(_) = &message {} else {
                trace!("received {:?}", message);
                self.shared_tx.read().forward(message);
            }
        }

        // Forward outgoing messages
        while let Async::Ready(Some(message)) = self.rx.poll()? {
            trace!("sending {:?}", message);
            self.link.send(message)?;
        }

        // Complete sends
        if let Async::NotReady = self.link.flush()? {
            return Ok(Async::NotReady)
        }

        Ok(Async::NotReady)
    }
}

impl<S: state::State> Drop for Peer<S> {
    fn drop(&mut self) {
        info!("disconnected from {}", self.peer_id);
        self.shared_tx.write().disconnect_peer(self.peer_id);
    }
}
