//! Raft node implementation
//! This module drives a raft-rs `RawNode`: ticking, stepping peer messages, proposing,
//! persisting ready state and applying committed entries to the state machine.

#![allow(clippy::field_reassign_with_default)]

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use slog::Drain;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

use protobuf::Message as PbMessage;
use raft::{prelude::*, StateRole};
use slog::o;

use crate::error::{Error, Result};
use crate::raft::proposal::{Proposal, ProposalOutcome};
use crate::raft::{Role, StateMachine};

use super::storage::LogStore;
use super::transport::Transport;

// Constants
const TICK_INTERVAL: Duration = Duration::from_millis(100); // Interval for raft tick
const LOGGER_CHANNEL_SIZE: usize = 4096; // Size of logger channel buffer
const MAILBOX_SIZE: usize = 1000;
const PROPOSAL_QUEUE_SIZE: usize = 1000;
const LEADER_WAIT: Duration = Duration::from_secs(60);

/// Creates the raft configuration used by every node
fn default_config(id: u64, applied: u64) -> Config {
    Config {
        id,
        election_tick: 10, // Number of ticks before starting election
        heartbeat_tick: 3, // Number of ticks between heartbeats
        applied,
        ..Default::default()
    }
}

fn root_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, o!())
}

/// Adds every configured peer that is not a voter yet, once this node leads the cluster.
pub async fn add_all_followers<R: Send + 'static>(
    handle: RaftHandle<R>,
    peers: Vec<(u64, String)>,
    timeout: Duration,
) {
    if !handle.wait_for_leader(LEADER_WAIT).await {
        log::warn!("Node {} did not become leader, not adding followers", handle.id());
        return;
    }
    for (id, addr) in peers {
        if id == handle.id() || handle.status().voters.contains(&id) {
            continue;
        }
        match handle.add_voter(id, addr.clone(), timeout).await {
            Ok(()) => log::info!("Added follower {} at {}", id, addr),
            Err(e) => log::error!("Failed to add follower {} at {}: {}", id, addr, e),
        }
    }
}

pub struct NodeOptions {
    pub id: u64,
    /// How often the state machine is asked for a snapshot
    pub snapshot_interval: Duration,
}

/// Point-in-time view of the node, published after every loop iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: u64,
    pub role: Role,
    pub term: u64,
    /// 0 when no leader is known
    pub leader_id: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub first_log_index: u64,
    pub last_log_index: u64,
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
}

/// A member of the current configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: u64,
    pub address: Option<String>,
    pub voter: bool,
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{Suffrage:{} ID:{} Address:{}}}",
            if self.voter { "Voter" } else { "Learner" },
            self.id,
            self.address.as_deref().unwrap_or("unknown")
        )
    }
}

/// Raft node implementation
pub struct Node<S: StateMachine> {
    raft_group: RawNode<LogStore>,
    transport: Transport,
    mailbox: Receiver<Message>,
    proposals: Receiver<Proposal<S::Response>>,
    proposed: VecDeque<Proposal<S::Response>>,
    state_machine: S,
    status: watch::Sender<NodeStatus>,
    snapshot_interval: Duration,
}

impl<S: StateMachine + Send + 'static> Node<S> {
    /// Starts the node loop on the current tokio runtime.
    ///
    /// The returned task ends with an error when the node can no longer make progress
    /// safely, for example when restoring a snapshot fails.
    pub fn start(
        options: NodeOptions,
        storage: LogStore,
        state_machine: S,
        transport: Transport,
    ) -> Result<(RaftHandle<S::Response>, JoinHandle<Result<()>>)> {
        let logger = root_logger().new(o!("tag" => format!("peer_{}", options.id)));
        let campaign = storage.freshly_bootstrapped();
        let cfg = default_config(options.id, storage.snapshot_index());
        let raft_group = RawNode::new(&cfg, storage, &logger)?;

        let (mailbox_tx, mailbox) = mpsc::channel(MAILBOX_SIZE);
        let (proposals_tx, proposals) = mpsc::channel(PROPOSAL_QUEUE_SIZE);
        let (status_tx, status_rx) = watch::channel(NodeStatus::default());

        let mut node = Node {
            raft_group,
            transport: transport.clone(),
            mailbox,
            proposals,
            proposed: VecDeque::new(),
            state_machine,
            status: status_tx,
            snapshot_interval: options.snapshot_interval,
        };
        if campaign {
            log::info!("Node {} bootstrapped a new cluster, campaigning", options.id);
            node.raft_group.campaign()?;
        }
        node.publish_status();

        let handle = RaftHandle {
            id: options.id,
            proposals: proposals_tx,
            mailbox: mailbox_tx,
            status: status_rx,
            transport,
        };
        let task = tokio::spawn(node.run());
        Ok((handle, task))
    }

    async fn run(mut self) -> Result<()> {
        let mut ticker = time::interval(TICK_INTERVAL);
        let mut last_snapshot = Instant::now();
        let mut last_snapshot_index = self.raft_group.raft.raft_log.applied;

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(msg) => {
                        self.step(msg);
                        while let Ok(msg) = self.mailbox.try_recv() {
                            self.step(msg);
                        }
                    }
                    None => {
                        log::info!("Raft mailbox closed, stopping node");
                        return Ok(());
                    }
                },
                proposal = self.proposals.recv() => match proposal {
                    Some(proposal) => {
                        self.propose(proposal);
                        while let Ok(proposal) = self.proposals.try_recv() {
                            self.propose(proposal);
                        }
                    }
                    None => {
                        log::info!("Proposal queue closed, stopping node");
                        return Ok(());
                    }
                },
                _ = ticker.tick() => {
                    self.raft_group.tick();
                }
            }

            let applied = self.raft_group.raft.raft_log.applied;
            if last_snapshot.elapsed() >= self.snapshot_interval && last_snapshot_index < applied {
                if let Err(e) = self.save_snapshot(applied) {
                    log::error!("Failed to save snapshot at index {}: {}", applied, e);
                }
                last_snapshot = Instant::now();
                last_snapshot_index = applied;
            }

            self.on_ready()?;
            self.publish_status();
        }
    }

    fn step(&mut self, msg: Message) {
        if let Err(e) = self.raft_group.step(msg) {
            log::debug!("Ignoring raft message: {}", e);
        }
    }

    /// Propose a new entry to the raft group
    /// Only the leader accepts proposals; anywhere else the submitter learns who leads.
    fn propose(&mut self, mut proposal: Proposal<S::Response>) {
        if self.raft_group.raft.state != StateRole::Leader {
            let leader_id = match self.raft_group.raft.leader_id {
                raft::INVALID_ID => None,
                id => Some(id),
            };
            proposal.respond(Err(Error::NotLeader { leader_id }));
            return;
        }

        let last_index = self.raft_group.raft.raft_log.last_index();
        let result = if let Some(data) = proposal.normal.take() {
            self.raft_group.propose(vec![], data)
        } else if let Some(ref cc) = proposal.conf_change {
            self.raft_group.propose_conf_change(vec![], cc.clone())
        } else {
            Ok(())
        };
        if let Err(e) = result {
            proposal.respond(Err(e.into()));
            return;
        }

        let new_last_index = self.raft_group.raft.raft_log.last_index();
        if new_last_index == last_index {
            proposal.respond(Err(Error::InternalProtocol(
                "proposal was not appended to the log".to_string(),
            )));
        } else {
            proposal.proposed = new_last_index;
            proposal.term = self.raft_group.raft.term;
            self.proposed.push_back(proposal);
        }
    }

    /// Process raft ready state
    /// Handles messages, snapshots, committed entries and persistence in the order raft-rs
    /// requires.
    fn on_ready(&mut self) -> Result<()> {
        if !self.raft_group.has_ready() {
            return Ok(());
        }

        let mut ready = self.raft_group.ready();

        // Step 1: Handle messages
        if !ready.messages().is_empty() {
            self.transport.send(ready.take_messages());
        }

        // Step 2: Handle snapshot if any
        if *ready.snapshot() != Snapshot::default() {
            self.handle_snapshot(ready.snapshot())?;
        }

        // Step 3: Handle committed entries
        self.handle_committed_entries(ready.take_committed_entries());

        // Step 4: Persist raft state
        let store = self.raft_group.mut_store();
        store.append_entries(ready.entries())?;
        if let Some(hs) = ready.hs() {
            store.set_hardstate(hs.clone())?;
        }
        if !ready.persisted_messages().is_empty() {
            self.transport.send(ready.take_persisted_messages());
        }

        // Step 5: Advance raft state
        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.raft_group.mut_store().set_commit(commit)?;
        }
        self.transport.send(light_rd.take_messages());
        self.handle_committed_entries(light_rd.take_committed_entries());
        self.raft_group.advance_apply();
        Ok(())
    }

    /// Installs a snapshot sent by the leader and hands its payload to the state machine.
    fn handle_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        log::info!(
            "Installing snapshot at index {} term {}",
            index,
            snapshot.get_metadata().term
        );
        self.raft_group.mut_store().apply_snapshot(snapshot)?;

        if !snapshot.get_data().is_empty() {
            let mut payload: &[u8] = snapshot.get_data();
            if let Err(e) = self.state_machine.restore(&mut payload) {
                log::error!("Restoring snapshot at index {} failed: {}", index, e);
                return Err(e);
            }
        }

        // Entries covered by the snapshot are never applied here
        while self
            .proposed
            .front()
            .map_or(false, |proposal| proposal.proposed <= index)
        {
            if let Some(mut proposal) = self.proposed.pop_front() {
                proposal.respond(Err(Error::LeadershipLost));
            }
        }
        Ok(())
    }

    /// Process committed entries
    /// Applies committed entries to the state machine and handles configuration changes
    fn handle_committed_entries(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            let outcome = if entry.data.is_empty() {
                Ok(None)
            } else {
                match entry.get_entry_type() {
                    EntryType::EntryConfChange => match self.apply_conf_change(&entry) {
                        Ok(()) => Ok(None),
                        Err(e) => {
                            log::error!("Failed to apply conf change at {}: {}", entry.index, e);
                            Err(e)
                        }
                    },
                    EntryType::EntryNormal => Ok(self.state_machine.apply(&entry)),
                    EntryType::EntryConfChangeV2 => {
                        log::warn!("Ignoring unsupported conf change v2 at {}", entry.index);
                        Ok(None)
                    }
                }
            };
            self.notice_proposed(&entry, outcome);
        }
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<()> {
        let mut cc = ConfChange::default();
        cc.merge_from_bytes(&entry.data)?;
        let cs = self.raft_group.apply_conf_change(&cc)?;
        self.raft_group.mut_store().set_conf_state(cs)?;

        match cc.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                if !cc.context.is_empty() {
                    let addr = String::from_utf8_lossy(&cc.context).into_owned();
                    self.transport.add_peer(cc.node_id, addr);
                }
            }
            ConfChangeType::RemoveNode => self.transport.remove_peer(cc.node_id),
        }
        log::info!(
            "Applied conf change {:?} for node {} at index {}",
            cc.get_change_type(),
            cc.node_id,
            entry.index
        );
        self.publish_status();
        Ok(())
    }

    /// Notify proposals about their status
    /// Completes the proposal made for this entry's index. A proposal from another term lost
    /// its slot to a different leader's entry.
    fn notice_proposed(&mut self, entry: &Entry, outcome: ProposalOutcome<S::Response>) {
        let mut outcome = Some(outcome);
        let mut i = 0;
        while i < self.proposed.len() {
            if self.proposed[i].proposed != entry.index {
                i += 1;
                continue;
            }
            if let Some(mut proposal) = self.proposed.remove(i) {
                let conf_change_dropped = proposal.conf_change.is_some()
                    && entry.get_entry_type() != EntryType::EntryConfChange;
                if proposal.term != entry.term {
                    proposal.respond(Err(Error::LeadershipLost));
                } else if conf_change_dropped {
                    proposal.respond(Err(Error::InternalProtocol(
                        "conf change was dropped, another change is pending".to_string(),
                    )));
                } else if let Some(outcome) = outcome.take() {
                    proposal.respond(outcome);
                }
            }
        }
    }

    /// Captures a state machine snapshot. An empty payload keeps the whole log.
    fn save_snapshot(&mut self, applied: u64) -> Result<()> {
        let mut snapshot = self.state_machine.snapshot()?;
        let mut data = Vec::new();
        let persisted = snapshot.persist(&mut data);
        snapshot.release();
        persisted?;

        if data.is_empty() {
            log::info!(
                "State machine snapshot at index {} is empty, keeping the raft log",
                applied
            );
            return Ok(());
        }
        self.raft_group.mut_store().save_snapshot(data, applied)?;
        log::info!("Save snapshot at index: {}", applied);
        Ok(())
    }

    fn publish_status(&self) {
        let raft = &self.raft_group.raft;
        let conf_state = self.raft_group.store().conf_state();
        let status = NodeStatus {
            id: raft.id,
            role: raft.state.into(),
            term: raft.term,
            leader_id: raft.leader_id,
            commit_index: raft.raft_log.committed,
            applied_index: raft.raft_log.applied,
            first_log_index: raft.raft_log.first_index(),
            last_log_index: raft.raft_log.last_index(),
            voters: conf_state.voters.clone(),
            learners: conf_state.learners.clone(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

/// Cloneable handle to a running node.
pub struct RaftHandle<R> {
    id: u64,
    proposals: Sender<Proposal<R>>,
    mailbox: Sender<Message>,
    status: watch::Receiver<NodeStatus>,
    transport: Transport,
}

impl<R> Clone for RaftHandle<R> {
    fn clone(&self) -> Self {
        RaftHandle {
            id: self.id,
            proposals: self.proposals.clone(),
            mailbox: self.mailbox.clone(),
            status: self.status.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl<R: Send + 'static> RaftHandle<R> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn current_role(&self) -> Role {
        self.status.borrow().role
    }

    pub fn leader_id(&self) -> Option<u64> {
        match self.status.borrow().leader_id {
            raft::INVALID_ID => None,
            id => Some(id),
        }
    }

    /// Submits `data` as a log entry and waits until it is applied or `timeout` elapses.
    ///
    /// A timeout says nothing about the entry: it may still commit and be applied.
    pub async fn submit(&self, data: Vec<u8>, timeout: Duration) -> ProposalOutcome<R> {
        let (proposal, rx) = Proposal::normal(data);
        self.propose(proposal, rx, timeout).await
    }

    /// Adds `id` as a voter reachable at `addr`.
    pub async fn add_voter(&self, id: u64, addr: String, timeout: Duration) -> Result<()> {
        let mut cc = ConfChange::default();
        cc.node_id = id;
        cc.set_change_type(ConfChangeType::AddNode);
        cc.context = addr.into_bytes().into();
        let (proposal, rx) = Proposal::conf_change(&cc);
        self.propose(proposal, rx, timeout).await.map(|_| ())
    }

    /// Removes `id` from the configuration.
    pub async fn remove_server(&self, id: u64, timeout: Duration) -> Result<()> {
        let mut cc = ConfChange::default();
        cc.node_id = id;
        cc.set_change_type(ConfChangeType::RemoveNode);
        let (proposal, rx) = Proposal::conf_change(&cc);
        self.propose(proposal, rx, timeout).await.map(|_| ())
    }

    async fn propose(
        &self,
        proposal: Proposal<R>,
        rx: tokio::sync::oneshot::Receiver<ProposalOutcome<R>>,
        timeout: Duration,
    ) -> ProposalOutcome<R> {
        let wait = async {
            self.proposals
                .send(proposal)
                .await
                .map_err(|_| Error::InternalProtocol("raft node is not running".to_string()))?;
            rx.await.map_err(|_| {
                Error::InternalProtocol("raft node dropped the proposal".to_string())
            })?
        };
        match time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ApplyTimeout(timeout)),
        }
    }

    /// Hands a message received from a peer to the node.
    pub async fn step(&self, msg: Message) -> Result<()> {
        self.mailbox
            .send(msg)
            .await
            .map_err(|_| Error::Transport("raft node is not running".to_string()))
    }

    /// Voters and learners of the latest configuration.
    pub fn configuration(&self) -> Vec<ServerInfo> {
        let status = self.status();
        let voters = status.voters.iter().map(|id| (*id, true));
        let learners = status.learners.iter().map(|id| (*id, false));
        voters
            .chain(learners)
            .map(|(id, voter)| ServerInfo {
                id,
                address: self.transport.address(id),
                voter,
            })
            .collect()
    }

    pub fn stats(&self) -> BTreeMap<String, String> {
        let status = self.status();
        let configuration = self
            .configuration()
            .iter()
            .map(|server| server.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let num_peers = status
            .voters
            .iter()
            .chain(status.learners.iter())
            .filter(|id| **id != self.id)
            .count();

        let mut stats = BTreeMap::new();
        stats.insert("state".to_string(), status.role.to_string());
        stats.insert("term".to_string(), status.term.to_string());
        stats.insert("leader_id".to_string(), status.leader_id.to_string());
        stats.insert("commit_index".to_string(), status.commit_index.to_string());
        stats.insert("applied_index".to_string(), status.applied_index.to_string());
        stats.insert("first_log_index".to_string(), status.first_log_index.to_string());
        stats.insert("last_log_index".to_string(), status.last_log_index.to_string());
        stats.insert("num_peers".to_string(), num_peers.to_string());
        stats.insert("latest_configuration".to_string(), format!("[{}]", configuration));
        stats
    }

    /// Waits until this node is leader. Returns false on timeout or when the node stopped.
    pub async fn wait_for_leader(&self, timeout: Duration) -> bool {
        let mut status = self.status.clone();
        let wait = async {
            loop {
                if status.borrow().role == Role::Leader {
                    return true;
                }
                if status.changed().await.is_err() {
                    return false;
                }
            }
        };
        time::timeout(timeout, wait).await.unwrap_or(false)
    }
}
