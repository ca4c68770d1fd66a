//! # Summary
//!
//! This module defines the `Consensus` struct: a sequence of independent
//! single-decree Paxos instances, one per log slot. Every replica plays
//! proposer, acceptor, and learner for every instance on demand; the
//! collocated replica drives proposals through the mailbox and learns
//! decisions back through its own.
//!
//! Safety rests on the classical invariant: a value is chosen at ballot
//! `b` only after a majority promised to refuse lower ballots, and a
//! proposer always adopts the accepted value with the highest reported
//! ballot. Quorum intersection then pins at most one value per instance.

use std::collections::HashMap as Map;

use futures::sync::mpsc;
use tokio::prelude::*;

use crate::message;
use crate::shared;
use crate::state;
use crate::thread::{peer, replica};

/// Consensus actors receive proposals and decision lookups from their
/// collocated replica, and Paxos traffic forwarded in from peers.
#[derive(Debug)]
pub enum In<C: state::Command> {
    Propose { instance: usize, value: C },
    GetDecision { instance: usize },
    Prepare(message::Prepare),
    Prepared(message::Prepared<C>),
    Accept(message::Accept<C>),
    Accepted(message::Accepted),
    Nack(message::Nack),
    Decide(message::Decide<C>),
}

/// Acceptor, learner, and (where this replica proposed) proposer state
/// for a single instance. Created lazily: any message may be the first
/// one we see for its instance.
#[derive(Derivative)]
#[derivative(Default(bound = ""))]
struct Instance<C: state::Command> {
    /// Highest ballot promised; refuses anything lower
    ballot: message::Ballot,

    /// Highest ballot accepted at, 0 for none
    accepted_ballot: message::Ballot,

    /// Value accepted at `accepted_ballot`
    accepted: Option<C>,

    /// Chosen value, once known. Latches exactly once and never changes.
    decision: Option<C>,

    /// Proposer bookkeeping; only present on the replica that proposed
    proposal: Option<Proposal<C>>,
}

/// One proposal attempt by the local replica.
struct Proposal<C: state::Command> {
    /// Ballot this attempt runs under
    ballot: message::Ballot,

    /// The command our replica asked us to propose
    value: C,

    /// Number of promises collected
    prepared: usize,

    /// Highest accepted ballot reported by any promise, 0 for none
    promised_ballot: message::Ballot,

    /// Value reported at `promised_ballot`
    promised: Option<C>,

    /// Value actually sent in the accept round: the adopted value if any
    /// promise reported one, our own otherwise
    chosen: Option<C>,

    /// Number of accept acknowledgements collected
    accepted: usize,

    /// Set once the accept round is broadcast; later promises for this
    /// ballot are duplicates and must not trigger a second round
    accept_sent: bool,
}

/// A sequence of single-decree Paxos instances.
pub struct Consensus<S: state::State> {
    /// Unique ID of this replica
    id: usize,

    /// Total number of replicas
    count: usize,

    /// Highest ballot this replica has proposed with, for any instance.
    /// Advances by `count` per attempt so ballots stay unique cluster-wide.
    ballot: message::Ballot,

    /// Per-instance state, created on first contact
    instances: Map<usize, Instance<S::Command>>,

    /// Intra-server receiving channel
    rx: mpsc::UnboundedReceiver<In<S::Command>>,

    /// Intra-server shared transmitting channels
    shared_tx: shared::Shared<S>,
}

impl<S: state::State> Consensus<S> {
    pub fn new(
        id: usize,
        count: usize,
        rx: mpsc::UnboundedReceiver<In<S::Command>>,
        shared_tx: shared::Shared<S>,
    ) -> Self {
        Consensus {
            id,
            count,
            ballot: id,
            instances: Map::default(),
            rx,
            shared_tx,
        }
    }

    /// Start a proposal attempt for `instance` on behalf of the local
    /// replica. An instance we already know the decision for immediately
    /// reports that decision instead of running another round.
    fn respond_propose(&mut self, instance: usize, value: S::Command) {
        let entry = self.instances.entry(instance).or_insert_with(Instance::default);

        if let Some(decision) = &entry.decision {
            self.shared_tx.read().send_replica(replica::In::Decided {
                instance,
                value: decision.clone(),
            });
            return;
        }

        self.ballot += self.count;
        let ballot = self.ballot;
        entry.proposal = Some(Proposal {
            ballot,
            value,
            prepared: 0,
            promised_ballot: 0,
            promised: None,
            chosen: None,
            accepted: 0,
            accept_sent: false,
        });

        debug!("proposing instance {} at ballot {}", instance, ballot);
        self.shared_tx.read().broadcast(peer::In::Prepare(message::Prepare {
            from: self.id,
            instance,
            ballot,
        }));
    }

    /// Local decision lookup for the replica's catch-up scan.
    fn respond_get_decision(&self, instance: usize) {
        let value = self.instances
            .get(&instance)
            .and_then(|entry| entry.decision.clone());
        self.shared_tx.read().send_replica(replica::In::Decision { instance, value });
    }

    /// Acceptor: promise the ballot if it outranks everything promised so
    /// far, reporting our accepted value so the proposer can adopt it.
    fn respond_prepare(&mut self, prepare: message::Prepare) {
        let entry = self.instances.entry(prepare.instance).or_insert_with(Instance::default);
        let reply = if prepare.ballot > entry.ballot {
            entry.ballot = prepare.ballot;
            peer::In::Prepared(message::Prepared {
                instance: prepare.instance,
                ballot: prepare.ballot,
                accepted_ballot: entry.accepted_ballot,
                accepted: entry.accepted.clone(),
            })
        } else {
            peer::In::Nack(message::Nack {
                instance: prepare.instance,
                ballot: prepare.ballot,
            })
        };
        self.shared_tx.read().send(prepare.from, reply);
    }

    /// Proposer: tally a promise. On a strict majority, run the accept
    /// round with the adopted value, or our own if no acceptor reported
    /// one.
    fn respond_prepared(&mut self, prepared: message::Prepared<S::Command>) {
        let entry = self.instances.entry(prepared.instance).or_insert_with(Instance::default);
        let proposal = match entry.proposal.as_mut() {
        | Some(proposal) => proposal,
        | None => return,
        };

        if prepared.ballot != proposal.ballot || proposal.accept_sent {
            return;
        }

        proposal.prepared += 1;
        if prepared.accepted_ballot > proposal.promised_ballot {
            proposal.promised_ballot = prepared.accepted_ballot;
            proposal.promised = prepared.accepted;
        }

        if proposal.prepared * 2 <= self.count {
            return;
        }

        let value = match &proposal.promised {
        | Some(adopted) if proposal.promised_ballot > 0 => adopted.clone(),
        | _ => proposal.value.clone(),
        };
        proposal.chosen = Some(value.clone());
        proposal.accept_sent = true;

        debug!("instance {} adopted at ballot {}", prepared.instance, proposal.ballot);
        self.shared_tx.read().broadcast(peer::In::Accept(message::Accept {
            from: self.id,
            instance: prepared.instance,
            ballot: proposal.ballot,
            value,
        }));
    }

    /// Acceptor: accept the value unless we have promised a higher ballot
    /// in the meantime.
    fn respond_accept(&mut self, accept: message::Accept<S::Command>) {
        let entry = self.instances.entry(accept.instance).or_insert_with(Instance::default);
        let reply = if accept.ballot >= entry.ballot {
            entry.ballot = accept.ballot;
            entry.accepted_ballot = accept.ballot;
            entry.accepted = Some(accept.value);
            peer::In::Accepted(message::Accepted {
                instance: accept.instance,
                ballot: accept.ballot,
            })
        } else {
            peer::In::Nack(message::Nack {
                instance: accept.instance,
                ballot: accept.ballot,
            })
        };
        self.shared_tx.read().send(accept.from, reply);
    }

    /// Proposer: tally an acknowledgement. On a strict majority the value
    /// is chosen: latch it, tell every learner, and hand the decision to
    /// the local replica.
    fn respond_accepted(&mut self, accepted: message::Accepted) {
        let entry = self.instances.entry(accepted.instance).or_insert_with(Instance::default);
        if entry.decision.is_some() {
            return;
        }

        let value = {
            let proposal = match entry.proposal.as_mut() {
            | Some(proposal) => proposal,
            | None => return,
            };
            if accepted.ballot != proposal.ballot {
                return;
            }
            proposal.accepted += 1;
            if proposal.accepted * 2 <= self.count {
                return;
            }
            match &proposal.chosen {
            | Some(value) => value.clone(),
            | None => return,
            }
        };

        info!("instance {} decided at ballot {}", accepted.instance, accepted.ballot);
        entry.decision = Some(value.clone());
        self.shared_tx.read().broadcast(peer::In::Decide(message::Decide {
            instance: accepted.instance,
            value: value.clone(),
        }));
        self.shared_tx.read().send_replica(replica::In::Decided {
            instance: accepted.instance,
            value,
        });
    }

    /// Proposer: an acceptor refused our ballot. Surface the failed
    /// attempt to the replica; whether to retry is its caller's policy.
    fn respond_nack(&mut self, nack: message::Nack) {
        let entry = self.instances.entry(nack.instance).or_insert_with(Instance::default);
        if entry.decision.is_some() {
            return;
        }
        let ours = match &entry.proposal {
        | Some(proposal) => nack.ballot == proposal.ballot,
        | None => false,
        };
        if ours {
            debug!("instance {} preempted at ballot {}", nack.instance, nack.ballot);
            self.shared_tx.read().send_replica(replica::In::Aborted { instance: nack.instance });
        }
    }

    /// Learner: latch the decision. Duplicates and conflicting
    /// re-deliveries are ignored; the first decision is final.
    fn respond_decide(&mut self, decide: message::Decide<S::Command>) {
        let entry = self.instances.entry(decide.instance).or_insert_with(Instance::default);
        if entry.decision.is_none() {
            trace!("instance {} decision learned", decide.instance);
            entry.decision = Some(decide.value);
        }
    }
}

impl<S: state::State> Future for Consensus<S> {
    type Item = ();
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        while let Async::Ready(Some(message)) = self.rx.poll()? {
            trace!("received {:?}", message);
            match message {
            | In::Propose { instance, value } => self.respond_propose(instance, value),
            | In::GetDecision { instance } => self.respond_get_decision(instance),
            | In::Prepare(m) => self.respond_prepare(m),
            | In::Prepared(m) => self.respond_prepared(m),
            | In::Accept(m) => self.respond_accept(m),
            | In::Accepted(m) => self.respond_accepted(m),
            | In::Nack(m) => self.respond_nack(m),
            | In::Decide(m) => self.respond_decide(m),
            }
        }
        Ok(Async::NotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drain, TestCommand, TestState};

    type Peers = Vec<mpsc::UnboundedReceiver<peer::In<TestCommand>>>;
    type Replica = mpsc::UnboundedReceiver<replica::In<TestCommand>>;
    type Loopback = mpsc::UnboundedReceiver<In<TestCommand>>;

    /// Consensus actor under test as replica 0 of `count`, with every
    /// other replica and the local mailboxes replaced by inspectable
    /// channels.
    fn cluster(count: usize) -> (Consensus<TestState>, Replica, Loopback, Peers) {
        let (consensus_tx, loopback_rx) = mpsc::unbounded();
        let (replica_tx, replica_rx) = mpsc::unbounded();
        let shared = shared::Shared::new(0, consensus_tx, replica_tx);
        let mut peer_rxs = Vec::new();
        for id in 1..count {
            let (tx, rx) = mpsc::unbounded();
            shared.write().connect_peer(id, tx);
            peer_rxs.push(rx);
        }
        let (_tx, rx) = mpsc::unbounded();
        let consensus = Consensus::new(0, count, rx, shared);
        (consensus, replica_rx, loopback_rx, peer_rxs)
    }

    fn command(local: usize) -> TestCommand {
        TestCommand { client: 7, local }
    }

    fn promise(instance: usize, ballot: usize) -> message::Prepared<TestCommand> {
        message::Prepared { instance, ballot, accepted_ballot: 0, accepted: None }
    }

    #[test]
    fn propose_broadcasts_prepare_to_every_acceptor() {
        let (mut consensus, replica_rx, loopback_rx, mut peer_rxs) = cluster(3);
        consensus.respond_propose(1, command(1));
        drop(consensus);

        for rx in peer_rxs.drain(..) {
            match &drain(rx)[..] {
            | [peer::In::Prepare(p)] => {
                assert_eq!(p.from, 0);
                assert_eq!(p.instance, 1);
                assert_eq!(p.ballot, 3);
            }
            | sent => panic!("expected a single prepare, got {:?}", sent),
            }
        }

        // Broadcasts loop back so our own acceptor votes too
        match &drain(loopback_rx)[..] {
        | [In::Prepare(p)] => assert_eq!(p.ballot, 3),
        | sent => panic!("expected a looped-back prepare, got {:?}", sent),
        }
        assert!(drain(replica_rx).is_empty());
    }

    #[test]
    fn ballots_strictly_increase_across_instances() {
        let (mut consensus, _replica_rx, loopback_rx, _peer_rxs) = cluster(3);
        consensus.respond_propose(1, command(1));
        consensus.respond_propose(2, command(2));
        drop(consensus);

        let ballots: Vec<usize> = drain(loopback_rx)
            .into_iter()
            .filter_map(|message| match message {
            | In::Prepare(p) => Some(p.ballot),
            | _ => None,
            })
            .collect();
        assert_eq!(ballots, vec![3, 6]);
    }

    #[test]
    fn prepare_promises_higher_ballots_and_nacks_lower() {
        let (mut consensus, _replica_rx, _loopback_rx, mut peer_rxs) = cluster(3);
        consensus.respond_prepare(message::Prepare { from: 1, instance: 1, ballot: 7 });
        consensus.respond_prepare(message::Prepare { from: 1, instance: 1, ballot: 4 });
        drop(consensus);

        match &drain(peer_rxs.remove(0))[..] {
        | [peer::In::Prepared(promised), peer::In::Nack(nack)] => {
            assert_eq!(promised.ballot, 7);
            assert_eq!(promised.accepted_ballot, 0);
            assert!(promised.accepted.is_none());
            assert_eq!(nack.ballot, 4);
        }
        | sent => panic!("expected promise then nack, got {:?}", sent),
        }
    }

    #[test]
    fn promise_reports_previously_accepted_value() {
        let (mut consensus, _replica_rx, _loopback_rx, mut peer_rxs) = cluster(3);
        consensus.respond_accept(message::Accept {
            from: 1,
            instance: 1,
            ballot: 4,
            value: command(9),
        });
        consensus.respond_prepare(message::Prepare { from: 2, instance: 1, ballot: 7 });
        drop(consensus);

        let _ = peer_rxs.remove(0);
        match &drain(peer_rxs.remove(0))[..] {
        | [peer::In::Prepared(promised)] => {
            assert_eq!(promised.accepted_ballot, 4);
            assert_eq!(promised.accepted, Some(command(9)));
        }
        | sent => panic!("expected a promise, got {:?}", sent),
        }
    }

    #[test]
    fn majority_of_promises_triggers_one_accept_round() {
        let (mut consensus, _replica_rx, loopback_rx, _peer_rxs) = cluster(3);
        consensus.respond_propose(1, command(1));
        consensus.respond_prepared(promise(1, 3));
        consensus.respond_prepared(promise(1, 3));
        // Duplicate delivery after the accept round must not re-broadcast
        consensus.respond_prepared(promise(1, 3));
        drop(consensus);

        let accepts: Vec<message::Accept<TestCommand>> = drain(loopback_rx)
            .into_iter()
            .filter_map(|message| match message {
            | In::Accept(a) => Some(a),
            | _ => None,
            })
            .collect();
        assert_eq!(accepts.len(), 1);
        assert_eq!(accepts[0].ballot, 3);
        assert_eq!(accepts[0].value, command(1));
    }

    #[test]
    fn proposer_adopts_value_with_highest_reported_ballot() {
        let (mut consensus, _replica_rx, loopback_rx, _peer_rxs) = cluster(5);
        consensus.respond_propose(1, command(1));
        consensus.respond_prepared(message::Prepared {
            instance: 1,
            ballot: 5,
            accepted_ballot: 1,
            accepted: Some(command(8)),
        });
        consensus.respond_prepared(message::Prepared {
            instance: 1,
            ballot: 5,
            accepted_ballot: 2,
            accepted: Some(command(9)),
        });
        consensus.respond_prepared(promise(1, 5));
        drop(consensus);

        let accepted: Vec<TestCommand> = drain(loopback_rx)
            .into_iter()
            .filter_map(|message| match message {
            | In::Accept(a) => Some(a.value),
            | _ => None,
            })
            .collect();
        assert_eq!(accepted, vec![command(9)]);
    }

    #[test]
    fn majority_of_acknowledgements_decides_once() {
        let (mut consensus, replica_rx, loopback_rx, _peer_rxs) = cluster(3);
        consensus.respond_propose(1, command(1));
        consensus.respond_prepared(promise(1, 3));
        consensus.respond_prepared(promise(1, 3));
        consensus.respond_accepted(message::Accepted { instance: 1, ballot: 3 });
        consensus.respond_accepted(message::Accepted { instance: 1, ballot: 3 });
        consensus.respond_accepted(message::Accepted { instance: 1, ballot: 3 });
        drop(consensus);

        match &drain(replica_rx)[..] {
        | [replica::In::Decided { instance, value }] => {
            assert_eq!(*instance, 1);
            assert_eq!(*value, command(1));
        }
        | sent => panic!("expected exactly one decision, got {:?}", sent),
        }

        let decides = drain(loopback_rx)
            .into_iter()
            .filter(|message| match message {
            | In::Decide(_) => true,
            | _ => false,
            })
            .count();
        assert_eq!(decides, 1);
    }

    #[test]
    fn stale_accept_is_nacked() {
        let (mut consensus, _replica_rx, _loopback_rx, mut peer_rxs) = cluster(3);
        consensus.respond_prepare(message::Prepare { from: 1, instance: 1, ballot: 7 });
        consensus.respond_accept(message::Accept {
            from: 2,
            instance: 1,
            ballot: 5,
            value: command(2),
        });
        drop(consensus);

        let _ = peer_rxs.remove(0);
        match &drain(peer_rxs.remove(0))[..] {
        | [peer::In::Nack(nack)] => assert_eq!(nack.ballot, 5),
        | sent => panic!("expected a nack, got {:?}", sent),
        }
    }

    #[test]
    fn nack_for_current_ballot_aborts_proposal() {
        let (mut consensus, replica_rx, _loopback_rx, _peer_rxs) = cluster(3);
        consensus.respond_propose(1, command(1));
        consensus.respond_nack(message::Nack { instance: 1, ballot: 99 });
        consensus.respond_nack(message::Nack { instance: 1, ballot: 3 });
        drop(consensus);

        match &drain(replica_rx)[..] {
        | [replica::In::Aborted { instance }] => assert_eq!(*instance, 1),
        | sent => panic!("expected a single abort, got {:?}", sent),
        }
    }

    #[test]
    fn decision_latches_and_never_changes() {
        let (mut consensus, replica_rx, _loopback_rx, _peer_rxs) = cluster(3);
        consensus.respond_decide(message::Decide { instance: 1, value: command(1) });
        consensus.respond_decide(message::Decide { instance: 1, value: command(2) });
        consensus.respond_get_decision(1);
        consensus.respond_get_decision(2);
        drop(consensus);

        match &drain(replica_rx)[..] {
        | [
            replica::In::Decision { instance: 1, value: Some(first) },
            replica::In::Decision { instance: 2, value: None },
        ] => assert_eq!(*first, command(1)),
        | sent => panic!("expected one decided and one undecided lookup, got {:?}", sent),
        }
    }

    #[test]
    fn propose_against_decided_instance_redelivers_decision() {
        let (mut consensus, replica_rx, loopback_rx, _peer_rxs) = cluster(3);
        consensus.respond_decide(message::Decide { instance: 1, value: command(2) });
        consensus.respond_propose(1, command(1));
        drop(consensus);

        match &drain(replica_rx)[..] {
        | [replica::In::Decided { instance, value }] => {
            assert_eq!(*instance, 1);
            assert_eq!(*value, command(2));
        }
        | sent => panic!("expected the existing decision, got {:?}", sent),
        }
        assert!(drain(loopback_rx).is_empty());
    }
}
