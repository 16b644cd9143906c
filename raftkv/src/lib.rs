//! A replicated key-value store: a raft log in front of a fjall storage engine.
//!
//! Writes are submitted to the leader through the [`gatekeeper`], replicated by the
//! [`raft`] node and applied by the state machine in [`fsm`]. Reads are served locally by the
//! [`reader`].

pub mod command;
pub mod config;
pub mod error;
pub mod fsm;
pub mod gatekeeper;
pub mod metrics;
pub mod raft;
pub mod reader;
pub mod server;
pub mod store;
