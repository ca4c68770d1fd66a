//! # Summary
//!
//! This module defines external connections to clients.
//! Responsible for forwarding submissions to the replica, replies back to
//! the client, and answering failure-detector probes on the spot.

use futures::sync::mpsc;
use tokio::net;
use tokio::prelude::*;

use crate::message;
use crate::shared;
use crate::socket;
use crate::state;
use crate::state::Command;

/// Represents a client that has not yet submitted a command, so we don't
/// know its ID. Heartbeat probes are answered in this phase too: the
/// failure detector connects long before it has anything to submit.
pub struct Connecting<S: state::State> {
    /// ID of this replica, sent in heartbeat replies
    self_id: usize,

    /// External connection to the client
    link: Option<socket::Link<message::Request<S::Command>, message::Reply<S::Response>>>,

    /// Intra-server shared transmitting channels
    shared_tx: Option<shared::Shared<S>>,
}

impl<S: state::State> Connecting<S> {
    pub fn new(
        self_id: usize,
        stream: net::TcpStream,
        shared_tx: shared::Shared<S>,
    ) -> Self {
        Connecting {
            self_id,
            link: Some(socket::Link::new(stream)),
            shared_tx: Some(shared_tx),
        }
    }
}

impl<S: state::State> Future for Connecting<S> {
    type Item = Client<S>;
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        while let Async::Ready(Some(message)) = self.link.as_mut().unwrap().poll_recv()? {
            match message {
            | message::Request::Heartbeat => {
                let link = self.link.as_mut().unwrap();
                link.send(message::Reply::Heartbeat(self.self_id))?;
                link.flush()?;
            }
            | message::Request::Submit(command) => {
                // The first submission carries the client's ID: we can
                // register its reply channel with the hub and promote the
                // connection to a Client. Safe to unwrap here because we
                // always initialize with Some and always return after
                // moving out of the options.
                let client_id = command.client_id();
                info!("connected to client {:?}", client_id);
                let (tx, rx) = mpsc::unbounded();
                let shared_tx = self.shared_tx.take().unwrap();
                shared_tx.write().connect_client(client_id.clone(), tx);
                shared_tx.read().send_replica(super::replica::In::Request(command));
                return Ok(Async::Ready(Client {
                    self_id: self.self_id,
                    client_id,
                    rx,
                    link: self.link.take().unwrap(),
                    shared_tx,
                }))
            }
            }
        }
        Ok(Async::NotReady)
    }
}

/// Represents a client with known ID that is registered with the shared
/// transmission hub.
pub struct Client<S: state::State> {
    /// ID of this replica, sent in heartbeat replies
    self_id: usize,

    /// Client ID
    client_id: <S::Command as state::Command>::ClientID,

    /// Intra-server receiving channel
    rx: mpsc::UnboundedReceiver<message::Reply<S::Response>>,

    /// External connection to the client
    link: socket::Link<message::Request<S::Command>, message::Reply<S::Response>>,

    /// Intra-server shared transmitting channels
    shared_tx: shared::Shared<S>,
}

impl<S: state::State> Future for Client<S> {
    type Item = ();
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {

        // Forward incoming submissions; answer probes directly
        while let Async::Ready(Some(message)) = self.link.poll_recv()? {
            match message {
            | message::Request::Heartbeat => {
                self.link.send(message::Reply::Heartbeat(self.self_id))?;
            }
            | message::Request::Submit(command) => {
                trace!("received {:?}", command);
                self.shared_tx.read().send_replica(super::replica::In::Request(command));
            }
            }
        }

        // Forward outgoing replies
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

impl<S: state::State> Drop for Client<S> {
    fn drop(&mut self) {
        info!("disconnected from client {:?}", self.client_id);
        self.shared_tx.write().disconnect_client(&self.client_id);
    }
}
