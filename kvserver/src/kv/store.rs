//! The deterministic in-memory map replicated by consensus.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::KvError;
use crate::kv::Command;

/// The authoritative replicated state.
///
/// Mutated only by the apply pump, in log order, so every replica that
/// consumes the same apply stream from the same snapshot reaches the same
/// state. Field order is the snapshot wire order; do not reorder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvStore {
    /// Counter backing session ids, starts at 1.
    unique_id: u64,
    /// Highest log index whose command has been applied.
    commit_index: u64,
    /// The key-value map itself.
    tab: HashMap<String, String>,
}

impl KvStore {
    /// An empty store whose commit index starts at the consensus log's
    /// base index (0 for a fresh log, the snapshot index after compaction).
    pub fn new(base_index: u64) -> Self {
        KvStore {
            unique_id: 1,
            commit_index: base_index,
            tab: HashMap::new(),
        }
    }

    /// Decodes a snapshot blob produced by [`KvStore::encode`].
    ///
    /// Truncated or malformed blobs are rejected; callers treat that as
    /// fatal since the replica cannot rejoin without its state.
    pub fn decode(data: &[u8]) -> Result<Self, KvError> {
        bincode::deserialize(data).map_err(KvError::Decode)
    }

    /// Serializes `{unique_id, commit_index, tab}` into the snapshot blob.
    pub fn encode(&self) -> Result<Vec<u8>, KvError> {
        bincode::serialize(self).map_err(KvError::Encode)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// Forces the commit index; used when an installed snapshot's metadata
    /// disagrees with the blob and the consensus-provided index wins.
    pub fn set_commit_index(&mut self, index: u64) {
        self.commit_index = index;
    }

    /// Records that the entry at `index` has been applied.
    pub fn advance_to(&mut self, index: u64) {
        debug_assert_eq!(index, self.commit_index + 1);
        self.commit_index = index;
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.tab.get(key)
    }

    pub fn len(&self) -> usize {
        self.tab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tab.is_empty()
    }

    /// Applies one decoded command. Returns the freshly formed session id
    /// for `OpenSession`, `None` for everything else.
    pub fn apply(&mut self, command: Command) -> Option<String> {
        match command {
            Command::OpenSession { nonce } => {
                let session_id = format!("{}-{}", self.unique_id, nonce);
                self.unique_id += 1;
                Some(session_id)
            }
            Command::Put { key, value } => {
                self.tab.insert(key, value);
                None
            }
            Command::Append { key, value } => {
                self.tab.entry(key).or_default().push_str(&value);
                None
            }
            Command::Delete { key } => {
                self.tab.remove(&key);
                None
            }
            Command::Get { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let mut store = KvStore::new(0);
        store.apply(Command::Put {
            key: "a".to_string(),
            value: "1".to_string(),
        });
        assert_eq!(store.get("a").map(String::as_str), Some("1"));
        store.apply(Command::Delete {
            key: "a".to_string(),
        });
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn append_extends_and_creates() {
        let mut store = KvStore::new(0);
        store.apply(Command::Put {
            key: "k".to_string(),
            value: "hello".to_string(),
        });
        store.apply(Command::Append {
            key: "k".to_string(),
            value: " world".to_string(),
        });
        assert_eq!(store.get("k").map(String::as_str), Some("hello world"));

        // Append to an absent key behaves like Put.
        store.apply(Command::Append {
            key: "new".to_string(),
            value: "x".to_string(),
        });
        assert_eq!(store.get("new").map(String::as_str), Some("x"));
    }

    #[test]
    fn open_session_ids_are_sequential() {
        let mut store = KvStore::new(0);
        let first = store
            .apply(Command::OpenSession {
                nonce: "abc".to_string(),
            })
            .unwrap();
        let second = store
            .apply(Command::OpenSession {
                nonce: "def".to_string(),
            })
            .unwrap();
        assert_eq!(first, "1-abc");
        assert_eq!(second, "2-def");
    }

    #[test]
    fn get_is_a_no_op() {
        let mut store = KvStore::new(0);
        store.apply(Command::Put {
            key: "a".to_string(),
            value: "1".to_string(),
        });
        let before = store.clone();
        assert!(store
            .apply(Command::Get {
                key: "a".to_string()
            })
            .is_none());
        assert_eq!(store, before);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut store = KvStore::new(0);
        store.apply(Command::OpenSession {
            nonce: "n".to_string(),
        });
        store.apply(Command::Put {
            key: "héllo".to_string(),
            value: "wörld".to_string(),
        });
        store.advance_to(1);
        store.advance_to(2);

        let blob = store.encode().unwrap();
        let restored = KvStore::decode(&blob).unwrap();
        assert_eq!(restored, store);
        assert_eq!(restored.commit_index(), 2);
    }

    #[test]
    fn decode_rejects_truncated_blob() {
        let mut store = KvStore::new(0);
        store.apply(Command::Put {
            key: "a".to_string(),
            value: "1".to_string(),
        });
        let blob = store.encode().unwrap();
        assert!(KvStore::decode(&blob[..blob.len() - 1]).is_err());
        assert!(KvStore::decode(&[]).is_err());
    }
}
