use log::warn;
use serde_derive::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::fsm::SnapshotMode;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub id: u64,
    pub addr: String,
}

/// Client API and metrics listeners
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
    pub metrics_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: "0.0.0.0:8080".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RaftConfig {
    pub node_id: u64,
    /// Listener for messages from the other raft peers
    pub addr: String,
    pub volume_dir: PathBuf,
    /// Start a new cluster with this node as its only voter
    pub bootstrap: bool,
    pub apply_timeout_ms: u64,
    pub snapshot_interval_secs: u64,
    pub snapshot_mode: SnapshotMode,
    pub peers: Vec<NodeConfig>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            node_id: 1,
            addr: "0.0.0.0:4000".to_string(),
            volume_dir: PathBuf::from("./volume"),
            bootstrap: false,
            apply_timeout_ms: 500,
            snapshot_interval_secs: 60,
            snapshot_mode: SnapshotMode::Noop,
            peers: Vec::new(),
        }
    }
}

impl RaftConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.volume_dir.join("data")
    }

    pub fn raft_dir(&self) -> PathBuf {
        self.volume_dir.join("raft")
    }

    pub fn peer_addresses(&self) -> Vec<(u64, String)> {
        self.peers
            .iter()
            .map(|peer| (peer.id, peer.addr.clone()))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub server: ServerConfig,
    pub raft: RaftConfig,
}

impl RuntimeConfig {
    /// Reads the config file. A missing file means defaults; a file that does not parse is
    /// an error.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = match std::fs::read_to_string(path.as_ref()) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file {}, using defaults: {:?}",
                    path.as_ref().display(),
                    e
                );
                return Ok(RuntimeConfig::default());
            }
        };
        Ok(toml::from_str(&contents)?)
    }
}
