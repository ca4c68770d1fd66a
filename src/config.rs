//! # Summary
//!
//! This module defines a single replica. A library user creates a
//! `Config` with a state machine implementation of their choice, and
//! then runs the returned future on a `tokio` runtime to launch the
//! replica: consensus module, state machine, and the listeners and
//! dialers that tie the cluster together.

use std::marker;
use std::time;

use futures::future;
use futures::sync::mpsc;
use tokio::prelude::*;

use crate::shared;
use crate::state;
use crate::thread;

/// Base port for replica-to-replica connections: replica `id` listens on
/// `PEER_PORT + id`.
const PEER_PORT: usize = 20000;

/// Defines a single replica with state type `S`.
#[derive(Debug)]
pub struct Config<S> {
    /// Unique replica ID; doubles as its leader-election rank
    id: usize,

    /// Port for incoming client connections
    port: usize,

    /// Total number of replicas
    count: usize,

    /// Base port for incoming peer connections
    peer_port: usize,

    /// Ping interval for peer connections
    timeout: time::Duration,

    /// How long a proposal may run before its client is told `Timeout`
    propose_timeout: time::Duration,

    _marker: marker::PhantomData<S>,
}

impl<S: state::State> Config<S> {

    /// Create a new replica with unique ID `id`, out of a cluster of
    /// `count` replicas, listening for clients on TCP port `port`.
    pub fn new(id: usize, port: usize, count: usize) -> Self {
        Config {
            id,
            port,
            count,
            peer_port: PEER_PORT,
            timeout: time::Duration::from_secs(1),
            propose_timeout: time::Duration::from_secs(5),
            _marker: Default::default(),
        }
    }

    /// Configure the ping interval on peer connections.
    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configure the proposal deadline.
    pub fn with_propose_timeout(mut self, timeout: time::Duration) -> Self {
        self.propose_timeout = timeout;
        self
    }

    /// Configure the base port for peer connections. Every replica in a
    /// cluster must agree on it.
    pub fn with_peer_port(mut self, port: usize) -> Self {
        self.peer_port = port;
        self
    }

    /// Launch the replica. The returned future must run on a `tokio`
    /// runtime; it spawns the long-lived actors and resolves once
    /// everything is wired up.
    pub fn run(self) -> impl Future<Item = (), Error = ()> {
        future::lazy(move || {
            let (consensus_tx, consensus_rx) = mpsc::unbounded();
            let (replica_tx, replica_rx) = mpsc::unbounded();

            let shared_tx: shared::Shared<S> = shared::Shared::new(
                self.id,
                consensus_tx,
                replica_tx,
            );

            // Listen for connections from peer replicas
            let peers = format!("127.0.0.1:{}", self.peer_port + self.id)
                .parse::<std::net::SocketAddr>()
                .map(|addr| tokio::net::TcpListener::bind(&addr))
                .expect("[INTERNAL ERROR]: invalid socket address")
                .expect("[INTERNAL ERROR]: failed to bind to socket");

            // Listen for connections from clients
            let clients = format!("127.0.0.1:{}", self.port)
                .parse::<std::net::SocketAddr>()
                .map(|addr| tokio::net::TcpListener::bind(&addr))
                .expect("[INTERNAL ERROR]: invalid socket address")
                .expect("[INTERNAL ERROR]: failed to bind to socket");

            let self_id = self.id;
            let timeout = self.timeout;

            // Promote inbound peer connections once they identify themselves
            let shared = shared_tx.clone();
            tokio::spawn(peers.incoming()
                .map_err(|_| ())
                .for_each(move |stream| {
                    let connecting = thread::peer::Connecting::new(
                        self_id,
                        stream,
                        shared.clone(),
                        timeout,
                    );
                    tokio::spawn(connecting.and_then(|peer| peer));
                    Ok(())
                }));

            // Promote inbound client connections once they submit
            let shared = shared_tx.clone();
            tokio::spawn(clients.incoming()
                .map_err(|_| ())
                .for_each(move |stream| {
                    let connecting = thread::client::Connecting::new(
                        self_id,
                        stream,
                        shared.clone(),
                    );
                    tokio::spawn(connecting.and_then(|client| client));
                    Ok(())
                }));

            // Attempt to connect to all other replicas directly on startup.
            // Replicas started later reach the ones started earlier through
            // their own dial-out, so the mesh closes either way.
            for peer_id in (0..self.count).filter(|peer| *peer != self_id) {
                let shared = shared_tx.clone();
                let addr = format!("127.0.0.1:{}", self.peer_port + peer_id)
                    .parse::<std::net::SocketAddr>()
                    .expect("[INTERNAL ERROR]: invalid socket address");
                let connect = tokio::net::TcpStream::connect(&addr)
                    .map_err(|_| ())
                    .and_then(move |stream| {
                        thread::peer::Peer::new(
                            self_id,
                            peer_id,
                            stream,
                            shared,
                            timeout,
                        )
                    })
                    .and_then(|peer| peer);
                tokio::spawn(connect);
            }

            // Spawn persistent consensus and replica actors
            tokio::spawn(thread::consensus::Consensus::new(
                self.id,
                self.count,
                consensus_rx,
                shared_tx.clone(),
            ));
            tokio::spawn(thread::replica::Replica::new(
                shared_tx,
                replica_rx,
                self.propose_timeout,
            ));

            Ok(())
        })
    }
}
