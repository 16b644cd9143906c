#![allow(clippy::field_reassign_with_default)]

use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use raft::prelude::*;

use crate::error::Result;

/// Outcome delivered to whoever submitted a proposal: the state machine's response once the
/// entry is applied (`None` for entries that produce no response), or the reason it failed.
pub type ProposalOutcome<R> = Result<Option<R>>;

pub struct Proposal<R> {
    pub normal: Option<Vec<u8>>,         // encoded command
    pub conf_change: Option<ConfChange>, // conf change.
    // If it's proposed, it will be set to the index and term of the entry.
    pub proposed: u64,
    pub term: u64,
    pub propose_success: Option<Sender<ProposalOutcome<R>>>,
}

impl<R> Proposal<R> {
    pub fn conf_change(cc: &ConfChange) -> (Self, Receiver<ProposalOutcome<R>>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            normal: None,
            conf_change: Some(cc.clone()),
            proposed: 0,
            term: 0,
            propose_success: Some(tx),
        };
        (proposal, rx)
    }

    pub fn normal(data: Vec<u8>) -> (Self, Receiver<ProposalOutcome<R>>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            normal: Some(data),
            conf_change: None,
            proposed: 0,
            term: 0,
            propose_success: Some(tx),
        };
        (proposal, rx)
    }

    /// Completes the proposal. The submitter may have stopped waiting, which is fine.
    pub fn respond(&mut self, outcome: ProposalOutcome<R>) {
        if let Some(sender) = self.propose_success.take() {
            let _ = sender.send(outcome);
        }
    }
}
