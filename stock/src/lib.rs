//! A replicated stock store: named items with non-negative quantities,
//! kept strongly consistent across replicas by the `rsm` library.
//!
//! The state machine and its commands live here, together with a typed
//! client facade over `rsm`'s submission handle.

use std::collections::HashMap as Map;
use std::net::SocketAddr;

use serde_derive::{Deserialize, Serialize};

/// A stock operation, tagged with the identity of its submission:
/// `client_id` names the submitting client and `local_id` is that
/// client's own monotonic counter. Replicas treat two commands with the
/// same tag as the same submission, so a retry can never be applied
/// twice.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Command {
    pub client_id: usize,
    pub local_id: usize,
    pub op: Op,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub enum Op {
    Create(String),
    Delete(String),
    Add(String, u64),
    Remove(String, u64),
    Query(String),
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Created,
    Deleted,
    Added(u64),
    Removed(u64),
    Stock(u64),
    DuplicateItem,
    NoSuchItem,
    InsufficientStock,
}

impl rsm::Command for Command {
    type ClientID = usize;
    type LocalID = usize;
    fn client_id(&self) -> usize {
        self.client_id
    }
    fn local_id(&self) -> usize {
        self.local_id
    }
}

/// The replicated application state: item name to stock level.
/// Quantities are unsigned and `Remove` checks before subtracting, so a
/// stock level can never go negative.
#[derive(Debug, Default)]
pub struct State {
    items: Map<String, u64>,
}

impl rsm::State for State {
    type Command = Command;
    type Response = Response;
    fn execute(&mut self, command: Command) -> Response {
        match command.op {
        | Op::Create(item) => {
            if self.items.contains_key(&item) {
                Response::DuplicateItem
            } else {
                self.items.insert(item, 0);
                Response::Created
            }
        }
        | Op::Delete(item) => {
            match self.items.remove(&item) {
            | Some(_) => Response::Deleted,
            | None => Response::NoSuchItem,
            }
        }
        | Op::Add(item, quantity) => {
            match self.items.get_mut(&item) {
            | Some(stock) => {
                *stock += quantity;
                Response::Added(*stock)
            }
            | None => Response::NoSuchItem,
            }
        }
        | Op::Remove(item, quantity) => {
            match self.items.get_mut(&item) {
            | Some(stock) if *stock >= quantity => {
                *stock -= quantity;
                Response::Removed(*stock)
            }
            | Some(_) => Response::InsufficientStock,
            | None => Response::NoSuchItem,
            }
        }
        | Op::Query(item) => {
            match self.items.get(&item) {
            | Some(stock) => Response::Stock(*stock),
            | None => Response::NoSuchItem,
            }
        }
        }
    }
}

/// Outcome of one facade call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// The operation went through
    Ok,
    /// The operation went through; current stock level of the item
    Stock(u64),
    DuplicateItem,
    NoSuchItem,
    InsufficientStock,
    /// No leader emerged, or every attempt was aborted
    Fail,
    /// The cluster did not answer in time; the operation may or may not
    /// have been applied
    Timeout,
}

/// Typed client for the stock store. Wraps an `rsm` backend handle and
/// tags every submission with this client's identity.
pub struct Client {
    handle: rsm::Handle<State>,
    id: usize,
    counter: usize,
}

impl Client {
    /// Spawn a backend over the given replica addresses. `id` must be
    /// unique among all clients of the cluster.
    pub fn new(id: usize, servers: Vec<SocketAddr>) -> Self {
        Client {
            handle: rsm::Backend::spawn(servers),
            id,
            counter: 0,
        }
    }

    pub fn create_item(&mut self, item: &str) -> Reply {
        assert!(!item.is_empty(), "item name must be non-empty");
        self.call(Op::Create(item.to_string()))
    }

    pub fn delete_item(&mut self, item: &str) -> Reply {
        assert!(!item.is_empty(), "item name must be non-empty");
        self.call(Op::Delete(item.to_string()))
    }

    pub fn add_stock(&mut self, item: &str, quantity: u64) -> Reply {
        assert!(!item.is_empty(), "item name must be non-empty");
        assert!(quantity >= 1, "quantity must be at least 1");
        self.call(Op::Add(item.to_string(), quantity))
    }

    pub fn remove_stock(&mut self, item: &str, quantity: u64) -> Reply {
        assert!(!item.is_empty(), "item name must be non-empty");
        assert!(quantity >= 1, "quantity must be at least 1");
        self.call(Op::Remove(item.to_string(), quantity))
    }

    pub fn query_stock(&mut self, item: &str) -> Reply {
        assert!(!item.is_empty(), "item name must be non-empty");
        self.call(Op::Query(item.to_string()))
    }

    fn call(&mut self, op: Op) -> Reply {
        self.counter += 1;
        let command = Command {
            client_id: self.id,
            local_id: self.counter,
            op,
        };
        match self.handle.submit(command) {
        | rsm::Outcome::Response(Response::Created) => Reply::Ok,
        | rsm::Outcome::Response(Response::Deleted) => Reply::Ok,
        | rsm::Outcome::Response(Response::Added(stock)) => Reply::Stock(stock),
        | rsm::Outcome::Response(Response::Removed(stock)) => Reply::Stock(stock),
        | rsm::Outcome::Response(Response::Stock(stock)) => Reply::Stock(stock),
        | rsm::Outcome::Response(Response::DuplicateItem) => Reply::DuplicateItem,
        | rsm::Outcome::Response(Response::NoSuchItem) => Reply::NoSuchItem,
        | rsm::Outcome::Response(Response::InsufficientStock) => Reply::InsufficientStock,
        | rsm::Outcome::Fail => Reply::Fail,
        | rsm::Outcome::Timeout => Reply::Timeout,
        }
    }
}
