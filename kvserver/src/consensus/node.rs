//! The raft driver task.
//!
//! A single task owns the `RawNode` and serializes everything that touches
//! it: peer messages, proposals, compaction requests, and ticks. Committed
//! entries are pushed onto the apply stream; outbound messages go to the
//! transport task through the out mailbox.

use std::collections::VecDeque;
use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::{prelude::*, StateRole};
use slog::{o, Drain};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use crate::error::KvError;
use crate::consensus::storage::FileStorage;
use crate::consensus::{ApplyMsg, NodeStatus, RaftHandle, RaftRequest};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const LOGGER_CHANNEL_SIZE: usize = 4096;
const REQUEST_CHANNEL_SIZE: usize = 1024;

fn raft_config(id: u64) -> Config {
    Config {
        id,
        election_tick: 10,
        heartbeat_tick: 3,
        ..Default::default()
    }
}

/// Everything a freshly started consensus module hands back to its owner.
pub struct RaftStart {
    pub handle: RaftHandle,
    /// Committed entries and installed snapshots, in commit order.
    pub apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
    /// Outbound peer messages for the transport task.
    pub out_mailbox: mpsc::Receiver<Message>,
    /// Index of the persisted snapshot the node restarted from.
    pub snapshot_index: u64,
    /// Application blob of that snapshot; empty when none was taken.
    pub snapshot_data: Vec<u8>,
}

struct PendingConfChange {
    index: u64,
    reply: oneshot::Sender<bool>,
}

struct Node {
    raft_group: RawNode<FileStorage>,
    out_mailbox: mpsc::Sender<Message>,
    peer_mailbox: mpsc::Receiver<Message>,
    requests: mpsc::Receiver<RaftRequest>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    status: Arc<NodeStatus>,
    pending_conf: VecDeque<PendingConfChange>,
}

/// Opens storage, spins up the driver task, and returns the handle plus
/// the apply stream. With `bootstrap` set, the node campaigns immediately
/// so a fresh single-voter cluster elects without waiting out a timeout.
pub fn start_raft(
    id: u64,
    bootstrap: bool,
    base_path: &str,
    peer_mailbox: mpsc::Receiver<Message>,
) -> Result<RaftStart, KvError> {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    let logger = slog::Logger::root(drain, o!("tag" => format!("peer_{}", id)));

    let storage = FileStorage::open(base_path, bootstrap, id)
        .map_err(|e| KvError::runtime("open raft storage", e))?;
    let (snapshot_index, snapshot_data) = storage.read_snapshot();

    let mut raft_group = RawNode::new(&raft_config(id), storage, &logger)
        .map_err(|e| KvError::runtime("create raft node", e))?;
    if bootstrap {
        let _ = raft_group.campaign();
    }

    let (out_tx, out_rx) = mpsc::channel(1000);
    let (req_tx, req_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
    let (apply_tx, apply_rx) = mpsc::unbounded_channel();
    let status = Arc::new(NodeStatus::default());

    let node = Node {
        raft_group,
        out_mailbox: out_tx,
        peer_mailbox,
        requests: req_rx,
        apply_tx,
        status: status.clone(),
        pending_conf: VecDeque::new(),
    };
    tokio::spawn(node.run());

    Ok(RaftStart {
        handle: RaftHandle::new(req_tx, status),
        apply_rx,
        out_mailbox: out_rx,
        snapshot_index,
        snapshot_data,
    })
}

/// Proposes `AddNode` for each peer in turn, retrying until the cluster
/// accepts it. Run by the bootstrap node once it has won its election.
pub async fn join_peers(handle: RaftHandle, ids: Vec<u64>) {
    for id in ids {
        loop {
            if handle.add_node(id).await {
                log::info!("peer {} added to the cluster", id);
                break;
            }
            log::debug!("peer {} not yet accepted, retrying", id);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

impl Node {
    async fn run(mut self) {
        let mut last_tick = Instant::now();
        loop {
            tokio::select! {
                Some(msg) = self.peer_mailbox.recv() => {
                    let _ = self.raft_group.step(msg);
                    while let Ok(msg) = self.peer_mailbox.try_recv() {
                        let _ = self.raft_group.step(msg);
                    }
                }
                Some(request) = self.requests.recv() => {
                    self.handle_request(request);
                    while let Ok(request) = self.requests.try_recv() {
                        self.handle_request(request);
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(1)) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.raft_group.tick();
                last_tick = Instant::now();
            }

            self.on_ready();
            self.status.update(
                self.raft_group.raft.term,
                self.raft_group.raft.state == StateRole::Leader,
            );
        }
    }

    fn handle_request(&mut self, request: RaftRequest) {
        match request {
            RaftRequest::Propose { data, reply } => {
                if self.raft_group.raft.state != StateRole::Leader {
                    let _ = reply.send((0, 0, false));
                    return;
                }
                let term = self.raft_group.raft.term;
                let index = self.raft_group.raft.raft_log.last_index() + 1;
                let accepted = self.raft_group.propose(vec![], data).is_ok()
                    && self.raft_group.raft.raft_log.last_index() >= index;
                if accepted {
                    let _ = reply.send((index, term, true));
                } else {
                    let _ = reply.send((0, 0, false));
                }
            }
            RaftRequest::ConfChange { cc, reply } => {
                if self.raft_group.raft.state != StateRole::Leader {
                    let _ = reply.send(false);
                    return;
                }
                let index = self.raft_group.raft.raft_log.last_index() + 1;
                let accepted = self.raft_group.propose_conf_change(vec![], cc).is_ok()
                    && self.raft_group.raft.raft_log.last_index() >= index;
                if accepted {
                    self.pending_conf.push_back(PendingConfChange { index, reply });
                } else {
                    let _ = reply.send(false);
                }
            }
            RaftRequest::Compact {
                last_included_index,
                data,
            } => {
                let store = &mut self.raft_group.raft.raft_log.store;
                if let Err(e) = store.save_snapshot(data, last_included_index) {
                    log::warn!(
                        "compaction at index {} failed: {}",
                        last_included_index,
                        e
                    );
                } else {
                    log::info!("log compacted through index {}", last_included_index);
                }
            }
        }
    }

    fn on_ready(&mut self) {
        if !self.raft_group.has_ready() {
            return;
        }
        let mut ready = self.raft_group.ready();

        if !ready.messages().is_empty() {
            Self::forward(&self.out_mailbox, &ready.take_messages());
        }

        if *ready.snapshot() != Snapshot::default() {
            self.install_snapshot(ready.snapshot().clone());
        }

        Self::commit_entries(
            &mut self.raft_group,
            ready.take_committed_entries(),
            &self.apply_tx,
            &mut self.pending_conf,
        );

        {
            let store = &mut self.raft_group.raft.raft_log.store;
            if let Err(e) = store.append_entries(ready.entries()) {
                log::error!("persisting raft log failed: {}, will retry", e);
                return;
            }
            if let Some(hs) = ready.hs() {
                store.set_hardstate(hs.clone());
            }
        }
        if !ready.persisted_messages().is_empty() {
            Self::forward(&self.out_mailbox, &ready.take_persisted_messages());
        }

        let mut light = self.raft_group.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.raft_group.raft.raft_log.store.set_commit(commit);
        }
        Self::forward(&self.out_mailbox, light.messages());
        Self::commit_entries(
            &mut self.raft_group,
            light.take_committed_entries(),
            &self.apply_tx,
            &mut self.pending_conf,
        );
        self.raft_group.advance_apply();
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) {
        let index = snapshot.get_metadata().index;
        let store = &mut self.raft_group.raft.raft_log.store;
        if let Err(e) = store.apply_snapshot(&snapshot) {
            log::error!("installing snapshot at index {} failed: {}", index, e);
            return;
        }
        let _ = self.apply_tx.send(ApplyMsg::Snapshot {
            index,
            data: snapshot.get_data().to_vec(),
        });
    }

    // Applies conf changes in-loop and surfaces every committed index on
    // the apply stream; non-client entries carry an empty payload so the
    // stream stays gapless.
    fn commit_entries(
        raft_group: &mut RawNode<FileStorage>,
        entries: Vec<Entry>,
        apply_tx: &mpsc::UnboundedSender<ApplyMsg>,
        pending_conf: &mut VecDeque<PendingConfChange>,
    ) {
        for entry in entries {
            let mut payload = Vec::new();
            if entry.get_entry_type() == EntryType::EntryConfChange {
                let mut cc = ConfChange::default();
                match cc.merge_from_bytes(entry.get_data()) {
                    Ok(()) => match raft_group.apply_conf_change(&cc) {
                        Ok(cs) => raft_group.raft.raft_log.store.set_conf_state(cs),
                        Err(e) => log::error!("applying conf change failed: {}", e),
                    },
                    Err(e) => log::warn!("undecodable conf change entry: {}", e),
                }
            } else {
                payload = entry.get_data().to_vec();
            }

            while pending_conf
                .front()
                .map_or(false, |p| p.index <= entry.index)
            {
                let pending = pending_conf.pop_front().unwrap();
                let _ = pending.reply.send(true);
            }

            let _ = apply_tx.send(ApplyMsg::Command {
                index: entry.index,
                term: entry.term,
                data: payload,
            });
        }
    }

    fn forward(out_mailbox: &mpsc::Sender<Message>, messages: &[Message]) {
        for msg in messages {
            if let Err(e) = out_mailbox.try_send(msg.clone()) {
                log::error!("forwarding raft message failed: {}, raft will retry", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn single_voter_commits_a_proposal() {
        let dir = TempDir::new().unwrap();
        let (_peer_tx, peer_rx) = mpsc::channel(16);
        let mut start = start_raft(1, true, dir.path().to_str().unwrap(), peer_rx).unwrap();

        let deadline = Instant::now() + Duration::from_secs(15);
        while !start.handle.get_state().1 {
            assert!(Instant::now() < deadline, "no leader elected");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let (index, term, is_leader) = start.handle.start(b"hello".to_vec()).await;
        assert!(is_leader);
        assert!(index > start.snapshot_index);

        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), start.apply_rx.recv())
                .await
                .expect("apply stream stalled")
                .expect("apply stream closed");
            match msg {
                ApplyMsg::Command {
                    index: i,
                    term: t,
                    data,
                } if i == index => {
                    assert_eq!(t, term);
                    assert_eq!(data, b"hello");
                    break;
                }
                _ => continue,
            }
        }
    }
}
