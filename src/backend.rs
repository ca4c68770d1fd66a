//! # Summary
//!
//! This module defines the client side of the cluster: an eventually
//! strong failure detector over the replica set, a monarchical leader
//! rule on top of it, and a blocking `Handle` for submitting commands.
//!
//! The `Backend` actor probes every replica each round and suspects the
//! silent ones. When a suspected replica answers after all, the probe
//! delay grows, so under partial synchrony suspicions eventually stop
//! flapping and every client settles on the same leader: the
//! lowest-ranked replica it does not suspect. Funnelling submissions
//! through that one replica is what gives the cluster a stable proposer
//! and with it liveness; safety never depends on the choice.

use std::collections::HashMap as Map;
use std::collections::HashSet as Set;
use std::net::SocketAddr;
use std::sync::mpsc as sync;
use std::time;

use futures::future;
use futures::sync::mpsc;
use tokio::prelude::*;
use tokio::timer;

use crate::message;
use crate::socket;
use crate::state;

/// Attempts before a submission is abandoned as `Fail`.
const RETRIES: usize = 5;

/// How long the handle waits for a leader answer, and how long it pauses
/// before retrying when there is none.
const LEADER_WAIT: time::Duration = time::Duration::from_secs(1);

/// How long the handle waits for a submitted command's reply.
const REPLY_WAIT: time::Duration = time::Duration::from_secs(6);

/// Initial probe delay, and the amount it grows by on a false suspicion.
const DELAY: time::Duration = time::Duration::from_secs(2);
const DELTA: time::Duration = time::Duration::from_secs(2);

/// Requests from the blocking handle to the backend actor.
pub enum In<S: state::State> {
    Leader {
        reply: sync::Sender<Option<usize>>,
    },
    Submit {
        server: usize,
        command: S::Command,
        reply: sync::Sender<message::Reply<S::Response>>,
    },
}

/// One established replica connection: replies in, requests out.
type Connection<S> = socket::Link<
    message::Reply<<S as state::State>::Response>,
    message::Request<<S as state::State>::Command>,
>;

/// Failure detector and submission router over the replica set.
pub struct Backend<S: state::State> {
    /// Replica addresses; the index is the replica's ID and rank
    servers: Vec<SocketAddr>,

    /// Established connections by replica ID
    connections: Map<usize, Connection<S>>,

    /// In-flight dials by replica ID
    connecting: Map<usize, tokio::net::tcp::ConnectFuture>,

    /// Replicas that answered a probe since the last round. Starts out
    /// holding everyone: a replica is only suspected once it has had a
    /// full round to answer and stayed silent.
    alive: Set<usize>,

    /// Replicas currently suspected to have failed
    suspected: Set<usize>,

    /// Current probe period
    delay: time::Duration,

    /// Probe period increment on a false suspicion
    delta: time::Duration,

    /// Next round's timer
    timer: timer::Delay,

    /// Requests from the blocking handle
    rx: mpsc::UnboundedReceiver<In<S>>,

    /// Reply channel of the submission in flight, if any
    waiting: Option<sync::Sender<message::Reply<S::Response>>>,
}

impl<S: state::State> Backend<S> {
    pub fn new(servers: Vec<SocketAddr>, rx: mpsc::UnboundedReceiver<In<S>>) -> Self {
        let connecting = servers.iter()
            .enumerate()
            .map(|(id, addr)| (id, tokio::net::TcpStream::connect(addr)))
            .collect();
        let alive = (0..servers.len()).collect();
        Backend {
            servers,
            connections: Map::default(),
            connecting,
            alive,
            suspected: Set::default(),
            delay: DELAY,
            delta: DELTA,
            timer: timer::Delay::new(time::Instant::now() + DELAY),
            rx,
            waiting: None,
        }
    }

    /// Launch a backend on its own runtime thread and return the
    /// blocking handle the application submits through.
    pub fn spawn(servers: Vec<SocketAddr>) -> Handle<S> {
        let (tx, rx) = mpsc::unbounded();
        std::thread::spawn(move || {
            tokio::run(future::lazy(move || {
                tokio::spawn(Backend::new(servers, rx));
                Ok(())
            }))
        });
        Handle { tx }
    }

    /// Lowest-ranked replica not currently suspected. Every client ranks
    /// replicas the same way, so matching suspicion sets mean a single
    /// cluster-wide leader.
    fn leader(&self) -> Option<usize> {
        (0..self.servers.len()).find(|server| !self.suspected.contains(server))
    }

    /// One failure-detector round.
    fn round(&mut self) {
        // An answer from a replica we suspect means we judged too
        // early: relax the probe delay for everyone.
        if self.alive.intersection(&self.suspected).next().is_some() {
            self.delay += self.delta;
            info!("false suspicion, raising probe delay to {:?}", self.delay);
        }

        for server in 0..self.servers.len() {
            if !self.alive.contains(&server) && !self.suspected.contains(&server) {
                info!("suspecting replica {}", server);
                self.suspected.insert(server);
            } else if self.alive.contains(&server) && self.suspected.contains(&server) {
                info!("trusting replica {} again", server);
                self.suspected.remove(&server);
            }
            self.probe(server);
        }

        self.alive.clear();
    }

    /// Send a heartbeat probe, redialing broken connections.
    fn probe(&mut self, server: usize) {
        let lost = match self.connections.get_mut(&server) {
        | Some(connection) => {
            connection.send(message::Request::Heartbeat).is_err()
                || connection.flush().is_err()
        }
        | None => {
            self.connect(server);
            return;
        }
        };
        if lost {
            self.connections.remove(&server);
            self.connect(server);
        }
    }

    /// Start dialing a replica unless a connection or dial is already up.
    fn connect(&mut self, server: usize) {
        if self.connections.contains_key(&server) || self.connecting.contains_key(&server) {
            return;
        }
        if let Some(addr) = self.servers.get(server) {
            self.connecting.insert(server, tokio::net::TcpStream::connect(addr));
        }
    }

    /// Route a submission to the chosen replica. Without an established
    /// connection the reply channel is dropped, which the handle reads
    /// as "try again shortly".
    fn respond_submit(
        &mut self,
        server: usize,
        command: S::Command,
        reply: sync::Sender<message::Reply<S::Response>>,
    ) {
        let sent = match self.connections.get_mut(&server) {
        | Some(connection) => {
            connection.send(message::Request::Submit(command)).is_ok()
                && connection.flush().is_ok()
        }
        | None => {
            self.connect(server);
            return;
        }
        };
        if sent {
            self.waiting = Some(reply);
        } else {
            self.connections.remove(&server);
            self.connect(server);
        }
    }

    /// Finish any dials that completed.
    fn poll_connecting(&mut self) {
        let mut ready = Vec::new();
        let mut failed = Vec::new();
        for (id, connect) in self.connecting.iter_mut() {
            match connect.poll() {
            | Ok(Async::Ready(stream)) => ready.push((*id, stream)),
            | Ok(Async::NotReady) => (),
            | Err(_) => failed.push(*id),
            }
        }
        for id in failed {
            self.connecting.remove(&id);
        }
        for (id, stream) in ready {
            debug!("connected to replica {}", id);
            self.connecting.remove(&id);
            self.connections.insert(id, socket::Link::new(stream));
        }
    }

    /// Drain every connection: heartbeat answers feed the failure
    /// detector, anything else answers the submission in flight.
    fn poll_connections(&mut self) {
        let mut dropped = Vec::new();
        let mut heartbeats = Vec::new();
        let mut answers = Vec::new();
        for (id, connection) in self.connections.iter_mut() {
            loop {
                match connection.poll_recv() {
                | Ok(Async::Ready(Some(message::Reply::Heartbeat(name)))) => heartbeats.push(name),
                | Ok(Async::Ready(Some(reply))) => answers.push(reply),
                | Ok(Async::Ready(None)) | Err(()) => {
                    dropped.push(*id);
                    break;
                }
                | Ok(Async::NotReady) => break,
                }
            }
            connection.flush().ok();
        }
        for id in dropped {
            debug!("lost connection to replica {}", id);
            self.connections.remove(&id);
        }
        for name in heartbeats {
            self.alive.insert(name);
        }
        for reply in answers {
            if let Some(waiting) = self.waiting.take() {
                waiting.send(reply).ok();
            }
        }
    }
}

impl<S: state::State> Future for Backend<S> {
    type Item = ();
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        while let Async::Ready(Some(message)) = self.rx.poll()? {
            match message {
            | In::Leader { reply } => {
                reply.send(self.leader()).ok();
            }
            | In::Submit { server, command, reply } => {
                self.respond_submit(server, command, reply);
            }
            }
        }

        self.poll_connecting();
        self.poll_connections();

        loop {
            match self.timer.poll() {
            | Ok(Async::Ready(())) => {
                self.round();
                self.timer.reset(time::Instant::now() + self.delay);
            }
            | Ok(Async::NotReady) => break,
            | Err(_) => return Err(()),
            }
        }

        Ok(Async::NotReady)
    }
}

/// Blocking facade over a spawned `Backend`. Clones share the same
/// failure detector.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct Handle<S: state::State> {
    tx: mpsc::UnboundedSender<In<S>>,
}

/// Terminal outcome of a submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<R> {
    /// The application's own answer, errors included
    Response(R),
    /// No leader emerged, or every attempt was aborted
    Fail,
    /// The cluster could not finish the command in time; it may or may
    /// not have gone through
    Timeout,
}

impl<S: state::State> Handle<S> {
    /// Ask the failure detector who the current leader is.
    pub fn leader(&self) -> Option<usize> {
        let (reply, rx) = sync::channel();
        self.tx.unbounded_send(In::Leader { reply }).ok();
        match rx.recv_timeout(LEADER_WAIT) {
        | Ok(leader) => leader,
        | Err(_) => None,
        }
    }

    /// Submit a command to the current leader and await its reply.
    /// Aborted attempts and leaderless pauses are retried a bounded
    /// number of times; timeouts are terminal, since the command may
    /// have been applied.
    pub fn submit(&self, command: S::Command) -> Outcome<S::Response> {
        for _ in 0..RETRIES {
            let server = match self.leader() {
            | Some(server) => server,
            | None => {
                std::thread::sleep(LEADER_WAIT);
                continue;
            }
            };

            let (reply, rx) = sync::channel();
            self.tx.unbounded_send(In::Submit { server, command: command.clone(), reply }).ok();
            match rx.recv_timeout(REPLY_WAIT) {
            | Ok(message::Reply::Answer(response)) => return Outcome::Response(response),
            | Ok(message::Reply::Abort) => continue,
            | Ok(message::Reply::Timeout) => return Outcome::Timeout,
            | Ok(message::Reply::Heartbeat(_)) => continue,
            | Err(sync::RecvTimeoutError::Timeout) => return Outcome::Timeout,
            | Err(sync::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(LEADER_WAIT);
                continue;
            }
            }
        }
        Outcome::Fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestState;

    fn backend(count: usize) -> Backend<TestState> {
        let servers = (0..count)
            .map(|id| format!("127.0.0.1:{}", 9000 + id).parse().unwrap())
            .collect();
        let (_tx, rx) = mpsc::unbounded();
        Backend::new(servers, rx)
    }

    #[test]
    fn starts_trusting_the_lowest_rank() {
        let backend = backend(3);
        assert_eq!(backend.leader(), Some(0));
    }

    #[test]
    fn silent_replicas_are_suspected_after_a_full_round() {
        let mut backend = backend(3);

        // The initial optimism covers the first round...
        backend.round();
        assert_eq!(backend.leader(), Some(0));

        // ...but silence through a second round condemns everyone.
        backend.round();
        assert_eq!(backend.leader(), None);
    }

    #[test]
    fn answers_restore_trust_and_rank_picks_the_monarch() {
        let mut backend = backend(3);
        backend.round();
        backend.round();

        backend.alive.insert(1);
        backend.alive.insert(2);
        backend.round();

        assert!(backend.suspected.contains(&0));
        assert_eq!(backend.leader(), Some(1));
    }

    #[test]
    fn false_suspicions_raise_the_probe_delay() {
        let mut backend = backend(3);
        backend.round();
        backend.round();
        assert_eq!(backend.delay, DELAY);

        backend.alive.insert(0);
        backend.round();

        assert_eq!(backend.delay, DELAY + DELTA);
        assert_eq!(backend.leader(), Some(0));
    }

    #[test]
    fn recovered_leader_reclaims_its_rank() {
        let mut backend = backend(3);
        backend.round();
        backend.round();

        backend.alive.insert(1);
        backend.round();
        assert_eq!(backend.leader(), Some(1));

        backend.alive.insert(0);
        backend.alive.insert(1);
        backend.round();
        assert_eq!(backend.leader(), Some(0));
    }
}
