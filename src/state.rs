//! # Summary
//!
//! This module defines the traits that together describe a replicated
//! state machine. Library users implement `State` for their application,
//! hand it to a `Config` to run replicas, and to a `Backend` to submit
//! commands from a client.

/// Unique identifier
pub trait Identifier: std::hash::Hash
    + std::fmt::Debug
    + Clone
    + Eq
    + Send
    + Sync
{
}

impl<T> Identifier for T where T: std::hash::Hash
    + std::fmt::Debug
    + Clone
    + Eq
    + Send
    + Sync
{
}

/// Operation that can be applied to a state machine.
///
/// The `(client_id, local_id)` pair identifies a command across the whole
/// cluster: replicas use it to recognize their own submissions in decided
/// instances, and to avoid applying a resubmitted command twice.
pub trait Command: Send
    + Clone
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
{
    type ClientID: Identifier;
    type LocalID: Identifier;
    fn client_id(&self) -> Self::ClientID;
    fn local_id(&self) -> Self::LocalID;

    /// Two commands are the same submission when they carry the same
    /// tag, whatever their payloads look like. Replicas recognize their
    /// own proposals in decided instances this way, and use it to drop
    /// retries of commands that already went through.
    fn same_submission(&self, other: &Self) -> bool {
        self.client_id() == other.client_id() &&
        self.local_id() == other.local_id()
    }
}

/// Result of applying an operation to a state machine.
///
/// Responses travel back over the wire to the submitting client, so unlike
/// commands they must deserialize on the client side as well.
pub trait Response: Send
    + Clone
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
{
}

impl<T> Response for T where T: Send
    + Clone
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
{
}

/// Replicated state machine.
///
/// `execute` must be deterministic: every replica applies the same
/// commands in the same order and must arrive at the same state.
pub trait State: Default + Send + 'static {
    type Command: Command;
    type Response: Response;
    fn execute(&mut self, command: Self::Command) -> Self::Response;
}
