//! Test support: a minimal state machine (commands append their local id
//! to a log and echo it back) and a helper for inspecting mailboxes.

use futures::sync::mpsc;
use serde_derive::{Deserialize, Serialize};
use tokio::prelude::*;

use crate::state;

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCommand {
    pub client: usize,
    pub local: usize,
}

impl state::Command for TestCommand {
    type ClientID = usize;
    type LocalID = usize;
    fn client_id(&self) -> usize {
        self.client
    }
    fn local_id(&self) -> usize {
        self.local
    }
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied(pub usize);

#[derive(Debug, Default)]
pub struct TestState {
    pub log: Vec<usize>,
}

impl state::State for TestState {
    type Command = TestCommand;
    type Response = Applied;
    fn execute(&mut self, command: TestCommand) -> Applied {
        self.log.push(command.local);
        Applied(command.local)
    }
}

/// Collect everything sent over a mailbox. Blocks until every sending
/// half has been dropped, so tests must tear down the actors under test
/// first.
pub fn drain<T>(rx: mpsc::UnboundedReceiver<T>) -> Vec<T> {
    rx.wait().filter_map(Result::ok).collect()
}
