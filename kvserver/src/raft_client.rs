//! Outbound raft transport.
//!
//! One background task drains the driver's out mailbox and fans messages
//! out over per-peer gRPC streams. Dead streams are marked invalid and
//! re-dialed on the next message; raft's own retries cover anything lost
//! in between.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tokio::sync::mpsc::{self, Receiver};

use crate::config;

pub mod pb {
    tonic::include_proto!("raft");
}

use pb::raft_service_client::RaftServiceClient;
use pb::PostDataRequest;

struct PeerClient {
    sender: mpsc::Sender<PostDataRequest>,
    invalid: Arc<AtomicBool>,
}

impl PeerClient {
    async fn connect(addr: String) -> Result<Self, tonic::transport::Error> {
        let mut client = RaftServiceClient::connect(addr).await?;
        let (sender, receiver) = mpsc::channel(1000);
        let invalid = Arc::new(AtomicBool::new(false));
        let flag = invalid.clone();
        tokio::spawn(async move {
            let stream = tokio_stream::wrappers::ReceiverStream::new(receiver);
            if let Err(e) = client.post_data(stream).await {
                log::error!("raft stream to peer failed: {}", e);
                flag.store(true, Ordering::SeqCst);
            }
        });
        Ok(PeerClient { sender, invalid })
    }
}

struct RaftClient {
    peers: HashMap<u64, PeerClient>,
}

impl RaftClient {
    fn new() -> Self {
        RaftClient {
            peers: HashMap::new(),
        }
    }

    async fn post_data(&mut self, msg: Message) {
        let to = msg.to;
        if let Some(peer) = self.peers.get(&to) {
            if peer.invalid.load(Ordering::SeqCst) {
                self.peers.remove(&to);
            }
        }
        if !self.peers.contains_key(&to) {
            let addr = match config::instance().lock().unwrap().peer_addr(to) {
                Some(addr) => addr,
                None => {
                    log::warn!("no address configured for peer {}", to);
                    return;
                }
            };
            match PeerClient::connect(addr).await {
                Ok(peer) => {
                    self.peers.insert(to, peer);
                }
                Err(e) => {
                    log::error!("connecting to peer {} failed: {}", to, e);
                    return;
                }
            }
        }

        let data = match msg.write_to_bytes() {
            Ok(data) => data,
            Err(e) => {
                log::error!("serializing raft message failed: {}", e);
                return;
            }
        };
        let peer = &self.peers[&to];
        if let Err(e) = peer.sender.try_send(PostDataRequest { data }) {
            log::debug!("dropping raft message to peer {}: {}", to, e);
        }
    }
}

/// Spawns the forwarder task for the driver's outbound messages.
pub fn start_forwarder(mut out_mailbox: Receiver<Message>) {
    tokio::spawn(async move {
        let mut client = RaftClient::new();
        while let Some(msg) = out_mailbox.recv().await {
            client.post_data(msg).await;
        }
    });
}
