//! # Summary
//!
//! This module defines the wire types exchanged between replicas and
//! between clients and replicas. `Prepare` through `Decide` are the
//! classical single-decree Paxos messages, sent once per consensus
//! instance. `Request` and `Reply` make up the client-facing protocol.
//! Commands travel inside these records as-is; what makes two commands
//! "the same" is the submission tag on the `state::Command` trait, not
//! anything this module adds.

use serde_derive::{Deserialize, Serialize};

use crate::state;

/// Ballots are plain integers, totally ordered and globally unique:
/// the replica at index `k` of a cluster of `n` only ever uses ballots
/// from the progression `k + n`, `k + 2n`, ... so two replicas can never
/// propose with the same ballot. Ballot 0 is reserved as "never promised"
/// and "never accepted".
pub type Ballot = usize;

/// Phase 1 query from a proposer to all acceptors.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Prepare {
    /// Proposing replica, and addressee of the reply
    pub from: usize,
    /// Targeted consensus instance
    pub instance: usize,
    /// Ballot the proposer wants promised
    pub ballot: Ballot,
}

/// Phase 1 promise from an acceptor back to the proposer: the acceptor
/// will ignore any ballot below `ballot`, and reports the value it last
/// accepted (if any) so the proposer can adopt it.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
#[derive(Clone, Debug)]
pub struct Prepared<C: state::Command> {
    pub instance: usize,
    /// Ballot being promised; echoes the `Prepare`
    pub ballot: Ballot,
    /// Highest ballot this acceptor has accepted at, 0 for none
    pub accepted_ballot: Ballot,
    /// Value accepted at `accepted_ballot`
    pub accepted: Option<C>,
}

/// Phase 2 query from a proposer to all acceptors.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
#[derive(Clone, Debug)]
pub struct Accept<C: state::Command> {
    /// Proposing replica, and addressee of the reply
    pub from: usize,
    pub instance: usize,
    pub ballot: Ballot,
    /// Value to accept at `ballot`
    pub value: C,
}

/// Phase 2 acknowledgement from an acceptor back to the proposer.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Accepted {
    pub instance: usize,
    pub ballot: Ballot,
}

/// Refusal from an acceptor that has already promised a higher ballot.
/// Surfaced to the proposing replica as an aborted proposal.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Nack {
    pub instance: usize,
    /// The refused ballot, so the proposer can match it to an attempt
    pub ballot: Ballot,
}

/// Learner broadcast: `value` has been chosen for `instance`. Decisions
/// are final; a replica that already knows one ignores this.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
#[derive(Clone, Debug)]
pub struct Decide<C: state::Command> {
    pub instance: usize,
    pub value: C,
}

/// Client-to-replica traffic: command submissions and failure-detector
/// probes.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
#[derive(Clone, Debug)]
pub enum Request<C: state::Command> {
    Submit(C),
    Heartbeat,
}

/// Replica-to-client traffic. `Answer` carries the application's response
/// for a command this replica proposed; `Abort` means another proposer
/// outran us; `Timeout` means no majority answered within the propose
/// deadline. `Heartbeat` answers a probe with the replica's id.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
#[derive(Clone, Debug)]
pub enum Reply<R: state::Response> {
    Answer(R),
    Abort,
    Timeout,
    Heartbeat(usize),
}
