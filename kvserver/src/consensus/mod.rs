//! Consensus module built on raft-rs.
//!
//! The rest of the service depends only on the surface exposed here: a
//! non-blocking submission call, a cheap leadership probe, a compaction
//! hook, and an apply stream delivering committed entries in order.

pub mod node;
mod segment;
mod storage;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use raft::eraftpb::ConfChange;
use tokio::sync::{mpsc, oneshot};

/// A message delivered on the apply stream, in commit order.
///
/// Every committed log index is surfaced exactly once: client commands
/// carry their payload, consensus-internal entries (election no-ops,
/// configuration changes) arrive with an empty payload so consumers see a
/// gapless index sequence.
#[derive(Debug)]
pub enum ApplyMsg {
    Command { index: u64, term: u64, data: Vec<u8> },
    Snapshot { index: u64, data: Vec<u8> },
}

/// Requests handled by the driver task.
pub(crate) enum RaftRequest {
    Propose {
        data: Vec<u8>,
        reply: oneshot::Sender<(u64, u64, bool)>,
    },
    ConfChange {
        cc: ConfChange,
        reply: oneshot::Sender<bool>,
    },
    Compact {
        last_included_index: u64,
        data: Vec<u8>,
    },
}

/// Leadership state refreshed by the driver every loop iteration.
#[derive(Default)]
pub(crate) struct NodeStatus {
    term: AtomicU64,
    leader: AtomicBool,
}

impl NodeStatus {
    pub(crate) fn update(&self, term: u64, leader: bool) {
        self.term.store(term, Ordering::Relaxed);
        self.leader.store(leader, Ordering::Relaxed);
    }
}

/// Cloneable handle to the consensus driver.
#[derive(Clone)]
pub struct RaftHandle {
    requests: mpsc::Sender<RaftRequest>,
    status: Arc<NodeStatus>,
}

impl RaftHandle {
    pub(crate) fn new(requests: mpsc::Sender<RaftRequest>, status: Arc<NodeStatus>) -> Self {
        RaftHandle { requests, status }
    }

    /// Submits a command to the log. Returns the assigned log index, the
    /// term at submission, and whether this node accepted it as leader.
    /// Does not wait for commitment.
    pub async fn start(&self, data: Vec<u8>) -> (u64, u64, bool) {
        let (tx, rx) = oneshot::channel();
        if self
            .requests
            .send(RaftRequest::Propose { data, reply: tx })
            .await
            .is_err()
        {
            return (0, 0, false);
        }
        rx.await.unwrap_or((0, 0, false))
    }

    /// Current term and whether this node believes it is the leader.
    pub fn get_state(&self) -> (u64, bool) {
        (
            self.status.term.load(Ordering::Relaxed),
            self.status.leader.load(Ordering::Relaxed),
        )
    }

    /// Hands the serialized state machine to the log layer; entries up
    /// through `last_included_index` may be discarded.
    pub async fn snapshot(&self, last_included_index: u64, data: Vec<u8>) {
        let _ = self
            .requests
            .send(RaftRequest::Compact {
                last_included_index,
                data,
            })
            .await;
    }

    /// Proposes adding a voter and waits for the change to commit.
    pub async fn add_node(&self, id: u64) -> bool {
        let mut cc = ConfChange::default();
        cc.node_id = id;
        cc.set_change_type(raft::eraftpb::ConfChangeType::AddNode);
        let (tx, rx) = oneshot::channel();
        if self
            .requests
            .send(RaftRequest::ConfChange { cc, reply: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}
