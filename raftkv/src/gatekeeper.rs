//! Write path: every mutation of the store goes through the leader's raft log.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::command::{CommandPayload, Operation, Value};
use crate::error::{Error, Result};
use crate::fsm::ApplyResult;
use crate::raft::{RaftHandle, Role};
use crate::store::check_key;

/// How long membership changes may take to be applied.
pub const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(10);

/// Rejects empty and oversized keys. Surrounding whitespace is not part of a key.
pub(crate) fn validate_key(key: &str) -> Result<&str> {
    let key = key.trim();
    check_key(key)?;
    Ok(key)
}

#[derive(Clone)]
pub struct Gatekeeper {
    raft: RaftHandle<ApplyResult>,
    apply_timeout: Duration,
}

impl Gatekeeper {
    pub fn new(raft: RaftHandle<ApplyResult>, apply_timeout: Duration) -> Self {
        Gatekeeper {
            raft,
            apply_timeout,
        }
    }

    /// Replicates one command and returns what the state machine made of it.
    ///
    /// Nothing reaches the log unless the key is valid and this node is the leader. An
    /// [`Error::ApplyTimeout`] leaves the outcome open: the command may still be applied.
    pub async fn submit(&self, operation: Operation, key: &str, value: Value) -> Result<ApplyResult> {
        let key = validate_key(key)?;
        self.ensure_leader()?;

        let data = CommandPayload::new(operation, key, value).encode()?;
        match self.raft.submit(data, self.apply_timeout).await? {
            Some(result) => Ok(result),
            None => Err(Error::InternalProtocol(format!(
                "no result for {} {}",
                operation, key
            ))),
        }
    }

    pub async fn add_voter(&self, id: u64, address: String) -> Result<()> {
        self.ensure_leader()?;
        self.raft.add_voter(id, address, MEMBERSHIP_TIMEOUT).await
    }

    pub async fn remove_server(&self, id: u64) -> Result<()> {
        self.ensure_leader()?;
        self.raft.remove_server(id, MEMBERSHIP_TIMEOUT).await
    }

    pub fn stats(&self) -> BTreeMap<String, String> {
        self.raft.stats()
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.raft.current_role() != Role::Leader {
            return Err(Error::NotLeader {
                leader_id: self.raft.leader_id(),
            });
        }
        Ok(())
    }
}
