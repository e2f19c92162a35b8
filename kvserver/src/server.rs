//! The replicated state machine core.
//!
//! One `KvServer` per process. RPC handlers submit commands through
//! [`KvServer::submit`]; a single apply pump drains the consensus apply
//! stream and is the sole writer of the state machine and the session
//! registry. A coarse mutex covers the store, the sessions, the pending
//! reply slots, and the snapshot threshold; every critical section is
//! short.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::config::RuntimeConfig;
use crate::error::KvError;
use crate::kv::{Command, KvStore};
use crate::consensus::node::{self, RaftStart};
use crate::consensus::{ApplyMsg, RaftHandle};
use crate::raft_client;

/// Outcome of one applied log entry, delivered to the waiting submitter.
/// `session_id` is populated only for OpenSession commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub term: u64,
    pub session_id: Option<String>,
}

// Everything behind the coordinator lock.
struct Inner {
    store: KvStore,
    sessions: HashMap<String, Instant>,
    reply_chan: HashMap<u64, oneshot::Sender<ApplyResult>>,
    snapshot_every: Option<u64>,
    next_snapshot_index: Option<u64>,
}

pub struct KvServer {
    inner: Mutex<Inner>,
    raft: RaftHandle,
    pub(crate) in_mailbox: mpsc::Sender<raft::eraftpb::Message>,
    me: u64,
    password: String,
    log_enabled: bool,
    session_timeout: Option<Duration>,
}

impl KvServer {
    /// Boots the node: opens raft storage, restores the state machine from
    /// the persisted snapshot, and spawns the apply pump, the session
    /// reaper, the outbound transport task, and (for the bootstrap node)
    /// the peer-join task.
    pub fn start(config: &RuntimeConfig) -> Result<Arc<KvServer>, KvError> {
        let (in_tx, in_rx) = mpsc::channel(1000);
        let RaftStart {
            handle,
            apply_rx,
            out_mailbox,
            snapshot_index,
            snapshot_data,
        } = node::start_raft(
            config.me,
            config.start_with_leader,
            &config.base_path,
            in_rx,
        )?;

        let store = if snapshot_data.is_empty() {
            KvStore::new(snapshot_index)
        } else {
            let mut store = KvStore::decode(&snapshot_data)?;
            if store.commit_index() != snapshot_index {
                log::warn!(
                    "snapshot blob carries commit index {} but raft says {}, using raft's",
                    store.commit_index(),
                    snapshot_index
                );
                store.set_commit_index(snapshot_index);
            }
            log::info!(
                "restored {} keys from snapshot at index {}",
                store.len(),
                snapshot_index
            );
            store
        };

        let snapshot_every = config.snapshot_threshold();
        let next_snapshot_index = snapshot_every.map(|n| store.commit_index() + n);
        match snapshot_every {
            Some(n) => log::info!("snapshotting every {} applied entries", n),
            None => log::info!("snapshotting disabled"),
        }
        let session_timeout = config.effective_session_timeout();
        match session_timeout {
            Some(t) => log::info!("idle sessions expire after {:?}", t),
            None => log::info!("sessions never expire"),
        }

        let server = Arc::new(KvServer {
            inner: Mutex::new(Inner {
                store,
                sessions: HashMap::new(),
                reply_chan: HashMap::new(),
                snapshot_every,
                next_snapshot_index,
            }),
            raft: handle.clone(),
            in_mailbox: in_tx,
            me: config.me,
            password: config.password.clone(),
            log_enabled: config.log_enabled,
            session_timeout,
        });

        tokio::spawn(run_apply(server.clone(), apply_rx));
        if let Some(timeout) = session_timeout {
            tokio::spawn(run_reaper(server.clone(), timeout));
        }
        raft_client::start_forwarder(out_mailbox);
        if config.start_with_leader {
            let peers = config
                .node_list
                .iter()
                .map(|n| n.id)
                .filter(|id| *id != config.me)
                .collect();
            tokio::spawn(node::join_peers(handle, peers));
        }
        Ok(server)
    }

    pub fn me(&self) -> u64 {
        self.me
    }

    /// Per-request diagnostics enabled?
    pub fn verbose(&self) -> bool {
        self.log_enabled
    }

    pub fn password_matches(&self, presented: &str) -> bool {
        presented == self.password
    }

    /// Cheap local leadership probe; no consensus round.
    pub fn is_leader(&self) -> bool {
        self.raft.get_state().1
    }

    /// Validates a session and refreshes its activity timestamp in one
    /// step under the coordinator lock.
    pub fn check_session(&self, session_id: &str) -> bool {
        self.inner.lock().unwrap().touch_session(session_id)
    }

    /// Reads a key from the state machine. Only meaningful after a Get
    /// command submitted by the caller has been applied.
    pub fn read(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().store.get(key).cloned()
    }

    /// Submits a command to consensus and waits for its apply outcome.
    ///
    /// Returns `None` when the command did not go through this node as
    /// leader: either consensus refused it outright, or the log slot was
    /// taken by a different command committed under a later term.
    pub async fn submit(&self, command: &Command) -> Option<ApplyResult> {
        let data = match bincode::serialize(command) {
            Ok(data) => data,
            Err(e) => {
                log::error!("encoding {} command failed: {}", command.kind(), e);
                return None;
            }
        };
        let (index, term, is_leader) = self.raft.start(data).await;
        if !is_leader {
            return None;
        }
        if self.log_enabled {
            log::info!(
                "[{}] {} submitted at index {}, term {}",
                self.me,
                command.kind(),
                index,
                term
            );
        }
        let rx = self.inner.lock().unwrap().install_slot(index, term);

        // The (index, term) pair identifies the committed entry: a bare
        // index can be reused by a later leader for a different command.
        match rx.await {
            Ok(result) if result.term == term => Some(result),
            _ => None,
        }
    }
}

impl Inner {
    /// Installs a fresh pending slot at `index`. Any earlier waiter at the
    /// same index is first handed a sentinel carrying the term observed
    /// now; its own submission term cannot match it, so it reports a lost
    /// leadership instead of waiting forever.
    fn install_slot(&mut self, index: u64, observed_term: u64) -> oneshot::Receiver<ApplyResult> {
        if let Some(displaced) = self.reply_chan.remove(&index) {
            let _ = displaced.send(ApplyResult {
                term: observed_term,
                session_id: None,
            });
        }
        let (tx, rx) = oneshot::channel();
        self.reply_chan.insert(index, tx);
        rx
    }

    fn touch_session(&mut self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(last_activity) => {
                *last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    fn sweep_sessions(&mut self, timeout: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, last_activity| last_activity.elapsed() < timeout);
        before - self.sessions.len()
    }

    /// Applies one committed entry: advances the commit index, mutates the
    /// store, delivers the pending slot, and arms the snapshot threshold.
    /// Returns the encoded snapshot when this entry crossed it.
    ///
    /// Entries with an empty payload are consensus-internal; they advance
    /// the commit index and deliver any waiting slot but carry no command.
    fn apply_command(
        &mut self,
        index: u64,
        term: u64,
        data: &[u8],
    ) -> Result<Option<Vec<u8>>, KvError> {
        let expected = self.store.commit_index() + 1;
        if index != expected {
            log::warn!(
                "ignoring out-of-order apply: expected index {}, got {}",
                expected,
                index
            );
            return Ok(None);
        }
        self.store.advance_to(index);

        let mut session_id = None;
        if !data.is_empty() {
            match bincode::deserialize::<Command>(data) {
                Ok(command) => {
                    session_id = self.store.apply(command);
                    if let Some(ref sid) = session_id {
                        self.sessions.insert(sid.clone(), Instant::now());
                    }
                }
                Err(e) => log::warn!("undecodable command at index {}: {}", index, e),
            }
        }

        if let Some(slot) = self.reply_chan.remove(&index) {
            let _ = slot.send(ApplyResult { term, session_id });
        }

        if self.next_snapshot_index == Some(index) {
            let every = self.snapshot_every.unwrap_or_default();
            self.next_snapshot_index = Some(index + every);
            return Ok(Some(self.store.encode()?));
        }
        Ok(None)
    }

    /// Restores the state machine from an installed snapshot. The session
    /// registry is untouched; sessions are a local concern.
    fn restore_snapshot(&mut self, index: u64, data: &[u8]) -> Result<(), KvError> {
        if data.is_empty() {
            self.store = KvStore::new(index);
            return Ok(());
        }
        let mut store = KvStore::decode(data)?;
        if store.commit_index() != index {
            log::warn!(
                "snapshot blob carries commit index {} but raft says {}, using raft's",
                store.commit_index(),
                index
            );
            store.set_commit_index(index);
        }
        self.store = store;
        Ok(())
    }
}

// The apply pump: single consumer of the apply stream, sole writer of the
// state machine. Snapshot codec failures here are unrecoverable; the
// process exits and rebuilds from the last good snapshot on restart.
async fn run_apply(server: Arc<KvServer>, mut apply_rx: mpsc::UnboundedReceiver<ApplyMsg>) {
    while let Some(msg) = apply_rx.recv().await {
        match msg {
            ApplyMsg::Command { index, term, data } => {
                let snapshot = {
                    let mut inner = server.inner.lock().unwrap();
                    match inner.apply_command(index, term, &data) {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            log::error!("[{}] {}", server.me, e);
                            std::process::exit(1);
                        }
                    }
                };
                if let Some(blob) = snapshot {
                    if server.verbose() {
                        log::info!("[{}] snapshot taken at index {}", server.me, index);
                    }
                    server.raft.snapshot(index, blob).await;
                }
            }
            ApplyMsg::Snapshot { index, data } => {
                let mut inner = server.inner.lock().unwrap();
                if let Err(e) = inner.restore_snapshot(index, &data) {
                    log::error!("[{}] {}", server.me, e);
                    std::process::exit(1);
                }
                log::info!("[{}] state restored from snapshot at index {}", server.me, index);
            }
        }
    }
}

async fn run_reaper(server: Arc<KvServer>, timeout: Duration) {
    loop {
        tokio::time::sleep(timeout).await;
        let removed = server.inner.lock().unwrap().sweep_sessions(timeout);
        if removed > 0 {
            log::info!("[{}] expired {} idle sessions", server.me, removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner(snapshot_every: Option<u64>) -> Inner {
        Inner {
            store: KvStore::new(0),
            sessions: HashMap::new(),
            reply_chan: HashMap::new(),
            snapshot_every,
            next_snapshot_index: snapshot_every,
        }
    }

    fn put(key: &str, value: &str) -> Vec<u8> {
        bincode::serialize(&Command::Put {
            key: key.to_string(),
            value: value.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn out_of_order_apply_is_ignored() {
        let mut inner = inner(None);
        assert!(inner.apply_command(2, 1, &put("a", "1")).unwrap().is_none());
        assert_eq!(inner.store.commit_index(), 0);
        assert!(inner.store.get("a").is_none());

        inner.apply_command(1, 1, &put("a", "1")).unwrap();
        assert_eq!(inner.store.commit_index(), 1);
        assert_eq!(inner.store.get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn empty_payload_advances_commit_only() {
        let mut inner = inner(None);
        inner.apply_command(1, 1, &[]).unwrap();
        assert_eq!(inner.store.commit_index(), 1);
        assert!(inner.store.is_empty());
    }

    #[test]
    fn apply_delivers_pending_slot() {
        let mut inner = inner(None);
        let mut rx = inner.install_slot(1, 3);
        inner.apply_command(1, 3, &put("a", "1")).unwrap();
        let result = rx.try_recv().unwrap();
        assert_eq!(result.term, 3);
        assert_eq!(result.session_id, None);
    }

    #[test]
    fn displaced_waiter_gets_unmatchable_term() {
        let mut inner = inner(None);
        let mut first = inner.install_slot(7, 2);
        let mut second = inner.install_slot(7, 5);

        // The first submitter sees term 5, which cannot equal its own
        // submission term 2: it reports WRONG_LEADER instead of hanging.
        let sentinel = first.try_recv().unwrap();
        assert_eq!(sentinel.term, 5);
        assert_eq!(sentinel.session_id, None);

        inner.apply_command(1, 1, &[]).unwrap();
        for i in 2..=6 {
            inner.apply_command(i, 5, &[]).unwrap();
        }
        inner.apply_command(7, 5, &put("k", "v")).unwrap();
        assert_eq!(second.try_recv().unwrap().term, 5);
    }

    #[test]
    fn open_session_registers_and_reports_id() {
        let mut inner = inner(None);
        let mut rx = inner.install_slot(1, 1);
        let cmd = bincode::serialize(&Command::OpenSession {
            nonce: "xyz".to_string(),
        })
        .unwrap();
        inner.apply_command(1, 1, &cmd).unwrap();

        let result = rx.try_recv().unwrap();
        assert_eq!(result.session_id.as_deref(), Some("1-xyz"));
        assert!(inner.touch_session("1-xyz"));
        assert!(!inner.touch_session("1-missing"));
    }

    #[test]
    fn snapshot_threshold_rearms() {
        let mut inner = inner(Some(2));
        assert!(inner.apply_command(1, 1, &put("a", "1")).unwrap().is_none());
        let blob = inner
            .apply_command(2, 1, &put("b", "2"))
            .unwrap()
            .expect("threshold crossed");
        assert_eq!(inner.next_snapshot_index, Some(4));

        let restored = KvStore::decode(&blob).unwrap();
        assert_eq!(restored.commit_index(), 2);
        assert_eq!(restored.get("b").map(String::as_str), Some("2"));

        assert!(inner.apply_command(3, 1, &put("c", "3")).unwrap().is_none());
        assert!(inner.apply_command(4, 1, &put("d", "4")).unwrap().is_some());
    }

    #[test]
    fn restore_prefers_consensus_index() {
        let mut inner = inner(None);
        let mut donor = KvStore::new(0);
        donor.apply(Command::Put {
            key: "a".to_string(),
            value: "1".to_string(),
        });
        donor.advance_to(1);
        let blob = donor.encode().unwrap();

        inner.restore_snapshot(9, &blob).unwrap();
        assert_eq!(inner.store.commit_index(), 9);
        assert_eq!(inner.store.get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn restore_rejects_corrupt_blob() {
        let mut inner = inner(None);
        assert!(inner.restore_snapshot(3, b"not a snapshot").is_err());
    }

    #[test]
    fn empty_snapshot_resets_to_index() {
        let mut inner = inner(None);
        inner.apply_command(1, 1, &put("a", "1")).unwrap();
        inner.restore_snapshot(5, &[]).unwrap();
        assert_eq!(inner.store.commit_index(), 5);
        assert!(inner.store.is_empty());
    }

    #[test]
    fn sweep_removes_only_idle_sessions() {
        let mut inner = inner(None);
        let timeout = Duration::from_millis(50);
        inner
            .sessions
            .insert("stale".to_string(), Instant::now() - timeout * 2);
        inner.sessions.insert("fresh".to_string(), Instant::now());

        assert_eq!(inner.sweep_sessions(timeout), 1);
        assert!(inner.sessions.contains_key("fresh"));
        assert!(!inner.sessions.contains_key("stale"));
    }
}
