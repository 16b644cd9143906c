//! Outbound raft messages.
//!
//! Every peer gets its own queue and a background task that POSTs the protobuf-encoded
//! messages to `http://{addr}/raft/message`. Raft retransmits on its own, so a failed peer
//! task drops what it holds and is recreated on the next send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request};
use protobuf::Message as PbMessage;
use raft::prelude::Message;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::error::{Error, Result};

pub const MESSAGE_PATH: &str = "/raft/message";
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

const PEER_QUEUE_SIZE: usize = 1000;

/// Client for a single peer node
struct PeerClient {
    sender: Sender<Message>,
    /// Set once the background task gave up on the peer
    invalid: Arc<AtomicBool>,
}

impl PeerClient {
    fn new(id: u64, addr: String, client: Client<HttpConnector>) -> Self {
        let (sender, receiver) = mpsc::channel(PEER_QUEUE_SIZE);
        let invalid = Arc::new(AtomicBool::new(false));
        let invalid_clone = invalid.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::stream_messages(&client, &addr, receiver).await {
                log::warn!("Sending raft messages to peer {} at {} failed: {}", id, addr, e);
                invalid_clone.store(true, Ordering::SeqCst);
            }
        });
        PeerClient { sender, invalid }
    }

    async fn stream_messages(
        client: &Client<HttpConnector>,
        addr: &str,
        mut receiver: Receiver<Message>,
    ) -> Result<()> {
        let uri = format!("http://{}{}", addr, MESSAGE_PATH);
        while let Some(message) = receiver.recv().await {
            let request = Request::builder()
                .method(Method::POST)
                .uri(uri.as_str())
                .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
                .body(Body::from(message.write_to_bytes()?))?;
            let response = client.request(request).await?;
            if !response.status().is_success() {
                return Err(Error::Transport(format!(
                    "peer answered {}",
                    response.status()
                )));
            }
        }
        Ok(())
    }
}

/// Address book and outbound queues for every known peer.
#[derive(Clone)]
pub struct Transport {
    id: u64,
    local_addr: String,
    addresses: Arc<RwLock<HashMap<u64, String>>>,
    peers: Arc<Mutex<HashMap<u64, PeerClient>>>,
    client: Client<HttpConnector>,
}

impl Transport {
    /// `local_addr` is this node's own raft address; `peers` seeds the address book.
    pub fn new<I>(id: u64, local_addr: impl Into<String>, peers: I) -> Self
    where
        I: IntoIterator<Item = (u64, String)>,
    {
        let addresses = peers.into_iter().filter(|(peer, _)| *peer != id).collect();
        Transport {
            id,
            local_addr: local_addr.into(),
            addresses: Arc::new(RwLock::new(addresses)),
            peers: Arc::new(Mutex::new(HashMap::new())),
            client: Client::new(),
        }
    }

    /// Records (or replaces) the raft address of `id`.
    pub fn add_peer(&self, id: u64, addr: String) {
        if id == self.id {
            return;
        }
        let previous = self
            .addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, addr.clone());
        if previous.as_deref() != Some(addr.as_str()) {
            log::info!("Peer {} is at {}", id, addr);
            self.peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        }
    }

    /// Forgets `id` and closes its queue.
    pub fn remove_peer(&self, id: u64) {
        self.addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        log::info!("Peer {} removed from the address book", id);
    }

    pub fn address(&self, id: u64) -> Option<String> {
        if id == self.id {
            return Some(self.local_addr.clone());
        }
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Queues messages for their destination peers. Never blocks; a full queue drops the
    /// message and raft sends it again later.
    pub fn send(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        for message in messages {
            let to = message.to;
            let stale = peers
                .get(&to)
                .map(|peer| peer.invalid.load(Ordering::SeqCst))
                .unwrap_or(true);
            if stale {
                let addr = match self.address(to) {
                    Some(addr) => addr,
                    None => {
                        log::warn!("No address known for peer {}, dropping raft message", to);
                        continue;
                    }
                };
                peers.insert(to, PeerClient::new(to, addr, self.client.clone()));
            }
            if let Some(peer) = peers.get(&to) {
                if let Err(e) = peer.sender.try_send(message) {
                    log::debug!("Failed to queue raft message for peer {}: {}", to, e);
                }
            }
        }
    }
}
