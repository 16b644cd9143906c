//! Error types for the replicated key-value store.

use std::time::Duration;

use thiserror::Error;

/// Error type shared by the storage adapter, the state machine, the write path and the
/// consensus node.
#[derive(Debug, Error)]
pub enum Error {
    /// The request failed input validation (for example an empty key).
    #[error("{0}")]
    Validation(String),

    /// A write was attempted on a node that is not the leader.
    #[error("not the leader{}", match .leader_id {
        Some(id) => format!(": current leader is node {id}"),
        None => String::new(),
    })]
    NotLeader {
        /// The current leader node ID, if known.
        leader_id: Option<u64>,
    },

    /// A command payload could not be encoded or decoded.
    #[error("error encoding command payload: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The key is not present in the storage engine.
    #[error("key {0} not found")]
    NotFound(String),

    /// The storage engine failed a transaction.
    #[error("storage error: {0}")]
    Storage(#[from] fjall::Error),

    /// The entry was not applied within the apply timeout. It may still commit.
    #[error("timed out after {0:?} waiting for the entry to be applied")]
    ApplyTimeout(Duration),

    /// The restore stream is not a well-formed array of key-value records.
    #[error("malformed restore stream: {0}")]
    RestoreDecode(#[source] serde_json::Error),

    /// The state machine produced no result, or a result of the wrong shape.
    #[error("internal protocol error: {0}")]
    InternalProtocol(String),

    /// Another entry was committed at the index of our proposal.
    #[error("leadership lost while the entry was in flight")]
    LeadershipLost,

    /// Error reported by the raft library.
    #[error("raft error: {0}")]
    Raft(#[from] raft::Error),

    /// A raft message or raft state record could not be (de)serialized.
    #[error("protobuf error: {0}")]
    Protobuf(#[from] protobuf::ProtobufError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("http request error: {0}")]
    HttpRequest(#[from] hyper::http::Error),

    /// A raft message could not be handed to the node or to a peer.
    #[error("transport error: {0}")]
    Transport(String),

    /// The configuration file could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// A configured listen address is not a socket address.
    #[error("invalid listen address {addr}: {reason}")]
    ListenAddr { addr: String, reason: String },
}

impl Error {
    /// HTTP status code the client API answers with for this error.
    pub fn status_code(&self) -> hyper::StatusCode {
        use hyper::StatusCode;
        match self {
            Error::Validation(_) | Error::NotLeader { .. } | Error::Encoding(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::ApplyTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenience type alias for Result with the crate Error.
pub type Result<T> = std::result::Result<T, Error>;
