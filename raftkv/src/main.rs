use anyhow::Context;
use clap::Parser;
use tokio::signal;

use raftkv::config::RuntimeConfig;
use raftkv::fsm::KvStateMachine;
use raftkv::gatekeeper::{Gatekeeper, MEMBERSHIP_TIMEOUT};
use raftkv::raft::{add_all_followers, LogStore, Node, NodeOptions, Transport};
use raftkv::reader::Reader;
use raftkv::server::Server;
use raftkv::store::Store;

#[derive(Parser, Debug)]
#[command(name = "raftkv", about = "Replicated key-value store")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = RuntimeConfig::from_toml(&args.config)
        .with_context(|| format!("failed to load config {}", args.config))?;
    let raft_config = config.raft.clone();

    let store = Store::open(raft_config.data_dir()).with_context(|| {
        format!("failed to open storage at {}", raft_config.data_dir().display())
    })?;
    let log_store = LogStore::open(
        raft_config.raft_dir(),
        raft_config.bootstrap.then_some(raft_config.node_id),
    )
    .with_context(|| format!("failed to open raft log at {}", raft_config.raft_dir().display()))?;

    let transport = Transport::new(
        raft_config.node_id,
        raft_config.addr.clone(),
        raft_config.peer_addresses(),
    );
    let state_machine = KvStateMachine::new(store.clone(), raft_config.snapshot_mode);
    let options = NodeOptions {
        id: raft_config.node_id,
        snapshot_interval: raft_config.snapshot_interval(),
    };
    let (raft, node_task) = Node::start(options, log_store, state_machine, transport)
        .context("failed to start raft node")?;

    let gatekeeper = Gatekeeper::new(raft.clone(), raft_config.apply_timeout());
    let reader = Reader::new(store);
    let server = Server::new(
        config.server.clone(),
        raft_config.addr.clone(),
        raft.clone(),
        gatekeeper,
        reader,
    );
    server.start().context("failed to start servers")?;

    if raft_config.bootstrap && !raft_config.peers.is_empty() {
        tokio::spawn(add_all_followers(
            raft.clone(),
            raft_config.peer_addresses(),
            MEMBERSHIP_TIMEOUT,
        ));
    }

    tokio::select! {
        _ = shutdown_signal() => {
            log::info!("server stop");
            Ok(())
        }
        outcome = node_task => {
            outcome
                .context("raft node task panicked")?
                .context("raft node stopped")?;
            anyhow::bail!("raft node stopped unexpectedly")
        }
    }
}
