//! Consensus layer: a raft-rs node loop plus the contract it drives a state machine through.

use std::fmt;
use std::io::{Read, Write};

use raft::prelude::Entry;
use raft::StateRole;

use crate::error::Result;

pub mod node;
pub mod proposal;
pub mod storage;
pub mod transport;

pub use node::{add_all_followers, Node, NodeOptions, NodeStatus, RaftHandle, ServerInfo};
pub use storage::LogStore;
pub use transport::Transport;

/// Role of the local node in the raft group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl From<StateRole> for Role {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Follower => Role::Follower,
            StateRole::PreCandidate => Role::PreCandidate,
            StateRole::Candidate => Role::Candidate,
            StateRole::Leader => Role::Leader,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "Follower",
            Role::PreCandidate => "PreCandidate",
            Role::Candidate => "Candidate",
            Role::Leader => "Leader",
        };
        f.write_str(name)
    }
}

/// State machine driven by the node loop.
///
/// The node calls these methods from a single task: `apply` strictly in committed-log order,
/// never concurrently with another `apply` or with `restore`.
pub trait StateMachine {
    /// Result handed back to the submitter of an entry.
    type Response: Send + 'static;

    /// Applies a committed entry. Returns `None` when the entry carries nothing this state
    /// machine understands.
    fn apply(&mut self, entry: &Entry) -> Option<Self::Response>;

    /// Captures a snapshot of the current state.
    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>>;

    /// Adopts the state contained in a snapshot payload.
    fn restore(&mut self, snapshot: &mut dyn Read) -> Result<()>;
}

/// A captured snapshot, written out by the node once it decides to keep it.
pub trait FsmSnapshot: Send {
    /// Writes the snapshot payload to `sink`.
    fn persist(&mut self, sink: &mut dyn Write) -> Result<()>;

    /// Called once the node is done with the snapshot.
    fn release(&mut self);
}
