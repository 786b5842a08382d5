//! Peer network: encrypted one-shot request/reply connections, message
//! dispatch into the node context, and sequential broadcast.

pub mod message;
pub mod transport;

pub use message::{DecodeError, Envelope, Reply, Status, MALFORMED_MESSAGE, UNKNOWN_MESSAGE_TYPE};
pub use transport::{SecureChannel, MAX_FRAME_LEN};

use crate::anchor::AnchorRecord;
use crate::blockchain::Block;
use crate::config::NetworkConfig;
use crate::crypto::NetworkKey;
use crate::error::{ChainError, Result};
use crate::node::NodeContext;
use crate::transaction::Transaction;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| ChainError::ConfigError(format!("Peer address {} lacks a port", s)))?;
        if host.is_empty() {
            return Err(ChainError::ConfigError(format!(
                "Peer address {} lacks a host",
                s
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| ChainError::ConfigError(format!("Invalid port in {}: {}", s, e)))?;
        Ok(PeerAddr::new(host, port))
    }
}

/// Outcome of one broadcast round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    /// Peers currently flagged for repeated failures.
    pub skipped: usize,
}

pub struct NetworkNode {
    ctx: Arc<NodeContext>,
    peers: RwLock<BTreeSet<PeerAddr>>,
    network_key: NetworkKey,
    request_timeout: Duration,
    connections: Arc<Semaphore>,
}

impl NetworkNode {
    pub fn new(ctx: Arc<NodeContext>, config: &NetworkConfig) -> Self {
        Self {
            ctx,
            peers: RwLock::new(BTreeSet::new()),
            network_key: NetworkKey::from_passphrase(&config.network_key),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            connections: Arc::new(Semaphore::new(config.max_connections)),
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub async fn add_peer(&self, peer: PeerAddr) -> bool {
        let added = self.peers.write().await.insert(peer.clone());
        if added {
            info!("Registered peer {}", peer);
        }
        added
    }

    pub async fn remove_peer(&self, peer: &PeerAddr) -> bool {
        self.peers.write().await.remove(peer)
    }

    pub async fn peers(&self) -> Vec<PeerAddr> {
        self.peers.read().await.iter().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Accept loop. Waits for a free connection slot before accepting, so at
    /// most `max_connections` requests are handled at once.
    pub async fn start_server(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("P2P server listening on {}", addr);
        }
        loop {
            let permit = self
                .connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ChainError::NetworkError(format!("Connection limiter closed: {}", e)))?;
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };

            let node = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match tokio::time::timeout(node.request_timeout, node.clone().handle_connection(stream))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Connection from {} failed: {}", remote, e),
                    Err(_) => warn!("Connection from {} timed out", remote),
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let mut channel = SecureChannel::server(stream, &self.network_key).await?;
        let request = channel.recv().await?;

        let reply = match Envelope::decode(&request) {
            Ok(envelope) => {
                debug!("Received {} message", envelope.kind());
                self.dispatch(envelope).await
            }
            Err(DecodeError::UnknownType(kind)) => {
                warn!("Unknown message type received: {}", kind);
                Reply::error(UNKNOWN_MESSAGE_TYPE)
            }
            Err(DecodeError::Malformed(e)) => {
                warn!("Malformed message received: {}", e);
                Reply::error(MALFORMED_MESSAGE)
            }
        };

        channel.send(&reply.encode()?).await?;
        channel.shutdown().await;
        Ok(())
    }

    pub async fn dispatch(self: &Arc<Self>, envelope: Envelope) -> Reply {
        match envelope {
            Envelope::Transaction { data } => {
                Reply::status(self.ctx.admit_transaction(data).await)
            }
            Envelope::Block { data } => match self.ctx.receive_block(data.clone()).await {
                Ok(()) => {
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.broadcast_block(&data).await;
                    });
                    Reply::status(Status::BlockAdded)
                }
                Err(e) => {
                    warn!("Block {} from peer rejected: {}", data.index, e);
                    Reply::status(Status::BlockRejected)
                }
            },
            Envelope::BitcoinAnchor { anchor } => self.receive_anchor(anchor),
            Envelope::RequestAnchorSync => Reply::anchor_sync(self.ctx.anchors.history()),
        }
    }

    fn receive_anchor(self: &Arc<Self>, anchor: AnchorRecord) -> Reply {
        if let Err(e) = anchor.validate() {
            warn!("Invalid anchor {}: {}", anchor.id, e);
            return Reply::status(Status::Invalid);
        }
        if !self.ctx.anchors.insert(anchor.clone()) {
            return Reply::status(Status::Duplicate);
        }
        info!("Anchor stored: {} -> {}", anchor.payload, anchor.reference);

        if let Some(next) = anchor.next_hop() {
            let node = self.clone();
            tokio::spawn(async move {
                node.broadcast(&Envelope::BitcoinAnchor { anchor: next }).await;
            });
        }
        Reply::status(Status::AnchorStored)
    }

    /// Connect, send one envelope, read one reply.
    pub async fn send_to(&self, peer: &PeerAddr, envelope: &Envelope) -> Result<Reply> {
        let payload = envelope.encode()?;
        self.send_payload(peer, &payload).await
    }

    async fn send_payload(&self, peer: &PeerAddr, payload: &[u8]) -> Result<Reply> {
        let exchange = async {
            let mut channel =
                SecureChannel::connect((peer.host.as_str(), peer.port), &self.network_key).await?;
            let reply = channel.request(payload).await?;
            channel.shutdown().await;
            Reply::decode(&reply)
        };
        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| ChainError::NetworkError(format!("Request to {} timed out", peer)))?
    }

    /// Send to every known peer, one after another. Failures are logged and
    /// counted against the peer; they never stop the round. An envelope that
    /// cannot be framed is dropped before any peer is contacted.
    pub async fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let payload = match envelope.encode() {
            Ok(payload) if payload.len() <= MAX_FRAME_LEN => payload,
            Ok(payload) => {
                error!(
                    "Not broadcasting {}: {} bytes exceeds the {} byte frame limit",
                    envelope.kind(),
                    payload.len(),
                    MAX_FRAME_LEN
                );
                return report;
            }
            Err(e) => {
                error!("Failed to encode {}: {}", envelope.kind(), e);
                return report;
            }
        };

        for peer in self.peers().await {
            let node_id = peer.to_string();
            if self.ctx.admission.is_flagged(&node_id) {
                debug!("Skipping flagged peer {}", peer);
                report.skipped += 1;
                continue;
            }
            match self.send_payload(&peer, &payload).await {
                Ok(reply) => {
                    debug!("{} to {}: {:?}", envelope.kind(), peer, reply);
                    report.delivered += 1;
                }
                Err(e) => {
                    warn!("Failed to send {} to {}: {}", envelope.kind(), peer, e);
                    self.ctx.admission.monitor_node(&node_id);
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub async fn broadcast_transaction(&self, tx: &Transaction) -> BroadcastReport {
        self.broadcast(&Envelope::Transaction { data: tx.clone() })
            .await
    }

    pub async fn broadcast_block(&self, block: &Block) -> BroadcastReport {
        self.broadcast(&Envelope::Block {
            data: block.clone(),
        })
        .await
    }

    pub async fn announce_anchor(&self, anchor: &AnchorRecord) -> BroadcastReport {
        self.broadcast(&Envelope::BitcoinAnchor {
            anchor: anchor.clone(),
        })
        .await
    }

    /// Pull a peer's anchor history and merge it; returns how many were new.
    pub async fn request_anchor_sync(&self, peer: &PeerAddr) -> Result<usize> {
        match self.send_to(peer, &Envelope::RequestAnchorSync).await {
            Ok(Reply::AnchorSync { anchors, .. }) => {
                let added = self.ctx.anchors.merge(anchors);
                info!("Anchor sync with {}: {} new anchors", peer, added);
                Ok(added)
            }
            Ok(other) => Err(ChainError::NetworkError(format!(
                "Unexpected anchor sync reply from {}: {:?}",
                peer, other
            ))),
            Err(e) => {
                error!("Anchor sync with {} failed: {}", peer, e);
                self.ctx.admission.monitor_node(&peer.to_string());
                Err(e)
            }
        }
    }
}
