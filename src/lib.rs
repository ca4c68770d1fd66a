//! A replicated state machine over single-decree Paxos.
//!
//! Implement `State` for your application, run one replica per `Config`,
//! and submit commands from anywhere through a `Backend` handle: every
//! replica applies the same commands in the same order, and each
//! submission is answered by the replica that proposed it.

#[macro_use] extern crate derivative;
#[macro_use] extern crate log;

mod backend;
mod config;
mod message;
mod shared;
mod socket;
mod state;
#[cfg(test)] mod testing;
mod thread;

pub use crate::backend::{Backend, Handle, Outcome};
pub use crate::config::Config;
pub use crate::state::{Command, Identifier, Response, State};
