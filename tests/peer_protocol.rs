//! Integration tests for the encrypted peer protocol
//!
//! Each test starts real nodes on loopback ports and talks to them over the
//! same encrypted channel peers use.

use kemchain::anchor::AnchorRecord;
use kemchain::blockchain::Block;
use kemchain::config::Config;
use kemchain::crypto::NetworkKey;
use kemchain::miner::mine_block;
use kemchain::network::{
    BroadcastReport, Envelope, PeerAddr, Reply, SecureChannel, Status, MAX_FRAME_LEN,
};
use kemchain::node::{Collaborators, Node};
use kemchain::persistence::InMemoryPersistence;
use kemchain::transaction::Transaction;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const NETWORK: &str = "kemchain-test";

fn test_config() -> Config {
    let mut config = Config::default();
    config.network.listen_addr = "127.0.0.1:0".to_string();
    config.network.network_key = NETWORK.to_string();
    config.network.request_timeout_secs = 2;
    config.chain.difficulty = 1;
    config
}

async fn start_node() -> (Arc<Node>, SocketAddr) {
    let node = Arc::new(
        Node::with_persistence(
            test_config(),
            Collaborators::default(),
            Arc::new(InMemoryPersistence::new()),
        )
        .expect("Failed to build node"),
    );
    let addr = node.clone().start().await.expect("Failed to start node");
    (node, addr)
}

fn peer(addr: SocketAddr) -> PeerAddr {
    PeerAddr::new(addr.ip().to_string(), addr.port())
}

async fn exchange_raw(addr: SocketAddr, payload: &[u8]) -> Reply {
    let mut channel = SecureChannel::connect(addr, &NetworkKey::from_passphrase(NETWORK))
        .await
        .expect("Failed to connect");
    let reply = channel.request(payload).await.expect("No reply");
    Reply::decode(&reply).expect("Undecodable reply")
}

async fn exchange(addr: SocketAddr, envelope: &Envelope) -> Reply {
    exchange_raw(addr, &envelope.encode().unwrap()).await
}

async fn next_block(node: &Node) -> Block {
    let template = node
        .ctx
        .chain
        .read()
        .await
        .next_block_template(Vec::new(), Some("peer-miner"), chrono::Utc::now().timestamp())
        .unwrap();
    mine_block(template).unwrap()
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    while !condition().await {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_tampered_block_is_rejected() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let (node, addr) = start_node().await;
        let mut block = next_block(&node).await;
        block.hash = format!("0{}", "f".repeat(63));

        let reply = exchange(addr, &Envelope::Block { data: block }).await;
        assert_eq!(reply.status_code(), Some(Status::BlockRejected));
        assert_eq!(node.ctx.chain.read().await.len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_valid_block_is_added_and_relayed() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let (first, first_addr) = start_node().await;
        let (second, second_addr) = start_node().await;
        first.network.add_peer(peer(second_addr)).await;

        let block = next_block(&first).await;
        let reply = exchange(first_addr, &Envelope::Block { data: block.clone() }).await;
        assert_eq!(reply.status_code(), Some(Status::BlockAdded));
        assert_eq!(first.ctx.chain.read().await.tip().hash, block.hash);

        wait_for(|| {
            let second = second.clone();
            async move { second.ctx.chain.read().await.len() == 2 }
        })
        .await;
        assert_eq!(second.ctx.chain.read().await.tip().hash, block.hash);

        let reply = exchange(second_addr, &Envelope::Block { data: block }).await;
        assert_eq!(reply.status_code(), Some(Status::BlockRejected));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_transaction_then_duplicate() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let (node, addr) = start_node().await;
        let tx = Transaction::new("alice", "bob", 1_000, 10, b"signed".to_vec()).unwrap();
        let envelope = Envelope::Transaction { data: tx.clone() };

        assert_eq!(exchange(addr, &envelope).await.status_code(), Some(Status::Success));
        assert_eq!(exchange(addr, &envelope).await.status_code(), Some(Status::Duplicate));
        assert!(node.ctx.mempool.read().await.contains(&tx.transaction_id));

        let mut forged = tx.clone();
        forged.recipient = "mallory".to_string();
        let reply = exchange(addr, &Envelope::Transaction { data: forged }).await;
        assert_eq!(reply.status_code(), Some(Status::Invalid));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_unknown_and_malformed_messages() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let (_node, addr) = start_node().await;

        let reply = exchange_raw(addr, br#"{"type": "gossip", "data": {}}"#).await;
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            serde_json::json!({"status": "error", "reason": "unknown_message_type"})
        );

        let reply = exchange_raw(addr, br#"{"type": "block", "data": 7}"#).await;
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            serde_json::json!({"status": "error", "reason": "malformed_message"})
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_anchor_flood_stops_at_seen_and_ttl() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let (first, first_addr) = start_node().await;
        let (second, second_addr) = start_node().await;
        first.network.add_peer(peer(second_addr)).await;
        second.network.add_peer(peer(first_addr)).await;

        let anchor = AnchorRecord::new("btc-txid", "00ab", Some(1), 3);
        let envelope = Envelope::BitcoinAnchor {
            anchor: anchor.clone(),
        };
        assert_eq!(
            exchange(first_addr, &envelope).await.status_code(),
            Some(Status::AnchorStored)
        );
        assert_eq!(
            exchange(first_addr, &envelope).await.status_code(),
            Some(Status::Duplicate)
        );

        wait_for(|| {
            let second = second.clone();
            let id = anchor.id.clone();
            async move { second.ctx.anchors.contains(&id) }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(first.ctx.anchors.len(), 1);
        assert_eq!(second.ctx.anchors.len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_anchor_sync() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let (source, source_addr) = start_node().await;
        let (fresh, _) = start_node().await;
        source.ctx.anchors.insert(AnchorRecord::new("a", "01", Some(1), 0));
        source.ctx.anchors.insert(AnchorRecord::new("b", "02", Some(2), 0));

        let reply = exchange(source_addr, &Envelope::RequestAnchorSync).await;
        assert_eq!(serde_json::to_value(&reply).unwrap()["type"], "anchor_sync");

        let added = fresh
            .network
            .request_anchor_sync(&peer(source_addr))
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(fresh.ctx.anchors.history(), source.ctx.anchors.history());
        assert_eq!(
            fresh.network.request_anchor_sync(&peer(source_addr)).await.unwrap(),
            0
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_wrong_network_key_gets_no_reply() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let (node, addr) = start_node().await;
        let mut channel = SecureChannel::connect(addr, &NetworkKey::from_passphrase("other-net"))
            .await
            .unwrap();
        let payload = Envelope::RequestAnchorSync.encode().unwrap();
        assert!(channel.request(&payload).await.is_err());
        assert_eq!(node.ctx.chain.read().await.len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_unreachable_peer_is_flagged_then_skipped() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let (node, _) = start_node().await;
        let dead = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let dead = peer(dead);
        node.network.add_peer(dead.clone()).await;

        let tx = Transaction::new("alice", "bob", 1, 0, b"sig".to_vec()).unwrap();
        for _ in 0..4 {
            let report = node.network.broadcast_transaction(&tx).await;
            assert_eq!(report.failed, 1);
        }
        assert!(node.ctx.admission.is_flagged(&dead.to_string()));

        let report = node.network.broadcast_transaction(&tx).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_oversized_broadcast_never_blames_peers() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let (node, _) = start_node().await;
        let (_listener, listener_addr) = start_node().await;
        let target = peer(listener_addr);
        node.network.add_peer(target.clone()).await;

        let mut tx = Transaction::new("alice", "bob", 1, 0, b"sig".to_vec()).unwrap();
        tx.metadata
            .insert("content".to_string(), "x".repeat(MAX_FRAME_LEN));
        for _ in 0..5 {
            let report = node.network.broadcast_transaction(&tx).await;
            assert_eq!(report, BroadcastReport::default());
        }
        assert!(node.ctx.admission.fault_record(&target.to_string()).is_none());
        assert!(!node.ctx.admission.is_flagged(&target.to_string()));
    })
    .await
    .expect("test timed out");
}
