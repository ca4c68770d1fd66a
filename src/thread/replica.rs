//! # Summary
//!
//! This module defines the `Replica` struct, which owns the application
//! state machine and linearizes locally submitted commands into the
//! replicated log.
//!
//! The replica works through its `pending` queue one command at a time:
//! catch up on every already-decided instance past `last_applied`, then
//! propose the oldest pending command for the first undecided instance
//! and wait for the consensus module to resolve the attempt. Decisions
//! for other replicas' commands are applied silently; only the replica
//! that proposed a command answers its client.

use std::collections::HashMap as Map;
use std::collections::VecDeque;
use std::time;

use futures::sync::mpsc;
use tokio::prelude::*;
use tokio::timer;

use crate::message;
use crate::shared;
use crate::state;
use crate::state::Command;
use crate::thread::consensus;

/// Replicas receive command submissions from connected clients, and
/// proposal outcomes and decision lookups from the collocated consensus
/// module.
#[derive(Debug)]
pub enum In<C: state::Command> {
    Request(C),
    Decision { instance: usize, value: Option<C> },
    Decided { instance: usize, value: C },
    Aborted { instance: usize },
}

/// What the processing loop is currently waiting on.
#[derive(Copy, Clone, Debug)]
enum Phase {
    /// Nothing pending
    Idle,
    /// Awaiting a decision lookup for `last_applied + 1`
    CatchUp,
    /// Awaiting the outcome of our proposal for this instance
    Propose { instance: usize },
}

/// Replicated state machine server.
pub struct Replica<S: state::State> {
    /// Intra-server receiving channel
    rx: mpsc::UnboundedReceiver<In<S::Command>>,

    /// Intra-server shared transmitting channels
    shared_tx: shared::Shared<S>,

    /// User-provided state machine
    state: S,

    /// Greatest instance whose decision has been applied here
    last_applied: usize,

    /// Commands applied so far, by instance. Consulted to keep a
    /// resubmitted command from ever being proposed twice.
    applied: Map<usize, S::Command>,

    /// Locally submitted commands awaiting proposal, oldest first
    pending: VecDeque<S::Command>,

    /// Current position in the processing loop
    phase: Phase,

    /// Deadline for the in-flight proposal
    deadline: Option<timer::Delay>,

    /// How long a proposal may run before its client is told `Timeout`
    propose_timeout: time::Duration,
}

impl<S: state::State> Replica<S> {
    pub fn new(
        shared_tx: shared::Shared<S>,
        rx: mpsc::UnboundedReceiver<In<S::Command>>,
        propose_timeout: time::Duration,
    ) -> Self {
        Replica {
            rx,
            shared_tx,
            state: S::default(),
            last_applied: 0,
            applied: Map::default(),
            pending: VecDeque::new(),
            phase: Phase::Idle,
            deadline: None,
            propose_timeout,
        }
    }

    /// Queue a submission; kick the processing loop if it was asleep.
    fn respond_request(&mut self, command: S::Command) {
        debug!("queueing {:?}", command);
        self.pending.push_back(command);
        if let Phase::Idle = self.phase {
            self.advance();
        }
    }

    /// Move to the next pending command, starting from a fresh catch-up
    /// scan, or go idle if the queue is empty.
    fn advance(&mut self) {
        self.deadline = None;
        if self.pending.is_empty() {
            self.phase = Phase::Idle;
        } else {
            self.phase = Phase::CatchUp;
            self.shared_tx.read().send_consensus(consensus::In::GetDecision {
                instance: self.last_applied + 1,
            });
        }
    }

    /// A decision lookup came back. Apply and keep scanning if the
    /// instance was decided; otherwise the slot is free and we propose
    /// the oldest pending command for it.
    fn respond_decision(&mut self, instance: usize, value: Option<S::Command>) {
        match self.phase {
        | Phase::CatchUp => (),
        | _ => return,
        }
        if instance != self.last_applied + 1 {
            return;
        }

        if let Some(value) = value {
            self.apply(value);
            self.advance();
            return;
        }

        // Drop resubmissions of commands that already went through in an
        // earlier instance: proposing them again would apply them twice.
        while let Some(front) = self.pending.front() {
            if self.applied.values().any(|previous| previous.same_submission(front)) {
                debug!("dropping already-applied resubmission {:?}", front);
                self.pending.pop_front();
            } else {
                break;
            }
        }

        let command = match self.pending.front() {
        | Some(command) => command.clone(),
        | None => {
            self.phase = Phase::Idle;
            return;
        }
        };

        self.phase = Phase::Propose { instance };
        self.deadline = Some(timer::Delay::new(time::Instant::now() + self.propose_timeout));
        self.shared_tx.read().send_consensus(consensus::In::Propose {
            instance,
            value: command,
        });
    }

    /// Our proposal's instance was decided, though not necessarily with
    /// our command: a competing proposer may have claimed the slot, in
    /// which case the pending command stays queued for the next one.
    fn respond_decided(&mut self, instance: usize, value: S::Command) {
        match self.phase {
        | Phase::Propose { instance: proposed } if proposed == instance => (),
        | _ => return,
        }
        self.apply(value);
        self.advance();
    }

    /// An acceptor refused our ballot. The attempt is over; the client
    /// decides whether to resubmit.
    fn respond_aborted(&mut self, instance: usize) {
        match self.phase {
        | Phase::Propose { instance: proposed } if proposed == instance => (),
        | _ => return,
        }
        if let Some(command) = self.pending.pop_front() {
            info!("proposal for instance {} aborted", instance);
            self.shared_tx.read().send_client(command.client_id(), message::Reply::Abort);
        }
        self.advance();
    }

    /// The propose deadline passed without an outcome. The instance may
    /// still decide later; catch-up will observe it, but this command's
    /// client gets a terminal `Timeout` for this submission.
    fn respond_expired(&mut self) {
        match self.phase {
        | Phase::Propose { instance } => info!("proposal for instance {} timed out", instance),
        | _ => return,
        }
        if let Some(command) = self.pending.pop_front() {
            self.shared_tx.read().send_client(command.client_id(), message::Reply::Timeout);
        }
        self.advance();
    }

    /// Apply a decided command at `last_applied + 1`. If it turns out to
    /// be one of our own queued submissions, answer its client and
    /// retire it from the queue.
    fn apply(&mut self, value: S::Command) {
        let ours = self.pending.iter().position(|pending| pending.same_submission(&value));
        match ours {
        | Some(index) => {
            self.pending.remove(index);
            self.execute(value, true);
        }
        | None => self.execute(value, false),
        }
    }

    fn execute(&mut self, value: S::Command, respond: bool) {
        let instance = self.last_applied + 1;
        info!("executing instance {}: {:?}", instance, value);
        let client_id = value.client_id();
        let response = self.state.execute(value.clone());
        if respond {
            self.shared_tx.read().send_client(client_id, message::Reply::Answer(response));
        }
        self.applied.insert(instance, value);
        self.last_applied = instance;
    }
}

impl<S: state::State> Future for Replica<S> {
    type Item = ();
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        while let Async::Ready(Some(message)) = self.rx.poll()? {
            debug!("received {:?}", message);
            match message {
            | In::Request(command) => self.respond_request(command),
            | In::Decision { instance, value } => self.respond_decision(instance, value),
            | In::Decided { instance, value } => self.respond_decided(instance, value),
            | In::Aborted { instance } => self.respond_aborted(instance),
            }
        }

        // Deadlines lose to outcomes already sitting in the mailbox,
        // which is why the queue drains first.
        let expired = match self.deadline.as_mut() {
        | Some(deadline) => match deadline.poll() {
            | Ok(Async::Ready(())) => true,
            | Ok(Async::NotReady) => false,
            | Err(_) => return Err(()),
            },
        | None => false,
        };
        if expired {
            self.deadline = None;
            self.respond_expired();
        }

        Ok(Async::NotReady)
    }
}
