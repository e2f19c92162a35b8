//! Runtime configuration for the key-value service.
//!
//! Loaded once from TOML at startup and kept in a global instance. All
//! validation happens at load time; the rest of the service only ever sees
//! resolved values.

use std::time::Duration;

use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::sync::Mutex;

use crate::error::KvError;

const DEFAULT_SERVER_PORT: u16 = 8080;
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 3600;

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

/// Returns a reference to the global configuration instance.
pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::default()))
}

/// A single peer in the raft cluster.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    /// Unique identifier for the node.
    pub id: u64,
    /// gRPC address of the node's raft transport.
    pub addr: String,
}

/// Runtime configuration for one service node.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// This node's identity. Must appear in `node_list`.
    pub me: u64,
    /// Shared secret checked by OpenSession.
    pub password: String,
    /// Client listener port. 0 selects the default; negative is rejected.
    pub port: i32,
    /// Snapshot every this many applied entries; <= 0 disables snapshots.
    pub max_raft_state: i64,
    /// Session idle expiry in seconds. 0 selects the default, negative
    /// means sessions never expire.
    pub session_timeout: i64,
    /// Per-request diagnostic logging.
    pub log_enabled: bool,
    /// Prometheus scrape port; 0 disables the metrics endpoint.
    pub metrics_port: u16,
    /// Directory for raft log segments and snapshots.
    pub base_path: String,
    /// Bootstrap this node as the initial single voter.
    pub start_with_leader: bool,
    /// All peers of the cluster, including this node.
    pub node_list: Vec<NodeConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            me: 1,
            password: String::new(),
            port: 0,
            max_raft_state: 0,
            session_timeout: 0,
            log_enabled: false,
            metrics_port: 0,
            base_path: "./data".to_string(),
            start_with_leader: false,
            node_list: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Loads and validates the configuration, installing it as the global
    /// instance on success.
    pub fn from_toml(path: &str) -> Result<Self, KvError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| KvError::Config(format!("cannot read config file {}: {}", path, e)))?;
        let config: RuntimeConfig = toml::from_str(&contents)
            .map_err(|e| KvError::Config(format!("cannot parse {}: {}", path, e)))?;
        config.validate()?;
        instance().lock().unwrap().clone_from(&config);
        Ok(config)
    }

    fn validate(&self) -> Result<(), KvError> {
        if self.port < 0 || self.port > u16::MAX as i32 {
            return Err(KvError::Config(format!(
                "listener port {} is invalid",
                self.port
            )));
        }
        if self.node_list.is_empty() {
            return Err(KvError::Config("node_list must not be empty".to_string()));
        }
        if !self.node_list.iter().any(|n| n.id == self.me) {
            return Err(KvError::Config(format!(
                "node id {} does not appear in node_list",
                self.me
            )));
        }
        Ok(())
    }

    /// The client listener port with the default applied.
    pub fn listen_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_SERVER_PORT
        } else {
            self.port as u16
        }
    }

    /// Resolved session expiry: `Some(timeout)` when sessions expire,
    /// `None` when they live forever.
    pub fn effective_session_timeout(&self) -> Option<Duration> {
        match self.session_timeout {
            0 => Some(Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS)),
            t if t > 0 => Some(Duration::from_secs(t as u64)),
            _ => None,
        }
    }

    /// Snapshot threshold, `None` when compaction is disabled.
    pub fn snapshot_threshold(&self) -> Option<u64> {
        if self.max_raft_state > 0 {
            Some(self.max_raft_state as u64)
        } else {
            None
        }
    }

    /// Transport address of a peer, looked up by node id.
    pub fn peer_addr(&self, id: u64) -> Option<String> {
        self.node_list
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.addr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> &'static str {
        r#"
            me = 1
            password = "secret"
            port = 0
            max_raft_state = 10
            session_timeout = 0
            log_enabled = true
            base_path = "./data"
            start_with_leader = true

            [[node_list]]
            id = 1
            addr = "grpc://127.0.0.1:5001"

            [[node_list]]
            id = 2
            addr = "grpc://127.0.0.1:5002"
        "#
    }

    #[test]
    fn parses_full_config() {
        let cfg: RuntimeConfig = toml::from_str(base_toml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.me, 1);
        assert_eq!(cfg.password, "secret");
        assert_eq!(cfg.listen_port(), 8080);
        assert_eq!(cfg.snapshot_threshold(), Some(10));
        assert_eq!(cfg.peer_addr(2).as_deref(), Some("grpc://127.0.0.1:5002"));
    }

    #[test]
    fn rejects_negative_port() {
        let mut cfg: RuntimeConfig = toml::from_str(base_toml()).unwrap();
        cfg.port = -1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_me() {
        let mut cfg: RuntimeConfig = toml::from_str(base_toml()).unwrap();
        cfg.me = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn session_timeout_resolution() {
        let mut cfg: RuntimeConfig = toml::from_str(base_toml()).unwrap();
        assert_eq!(
            cfg.effective_session_timeout(),
            Some(Duration::from_secs(3600))
        );
        cfg.session_timeout = 5;
        assert_eq!(cfg.effective_session_timeout(), Some(Duration::from_secs(5)));
        cfg.session_timeout = -1;
        assert_eq!(cfg.effective_session_timeout(), None);
    }

    #[test]
    fn snapshot_disabled_when_not_positive() {
        let mut cfg: RuntimeConfig = toml::from_str(base_toml()).unwrap();
        cfg.max_raft_state = 0;
        assert_eq!(cfg.snapshot_threshold(), None);
        cfg.max_raft_state = -3;
        assert_eq!(cfg.snapshot_threshold(), None);
    }
}
