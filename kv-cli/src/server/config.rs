use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_PROMPT: &str = "kvserverd";
const DEFAULT_DATA_DIR: &str = "data/kvserverd";

/// Which storage engine backs the apply loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Memory,
    Persistent,
}

impl Default for EngineKind {
    fn default() -> Self {
        EngineKind::Persistent
    }
}

/// Per-connection and per-node resource caps, enforced at the gRPC service
/// boundary rather than inside kvcore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCaps {
    pub max_concurrent_streams: u32,
    pub max_message_bytes: usize,
    pub max_watches_per_node: usize,
    pub max_leases_per_node: usize,
    /// Token-bucket request rate, in requests per second; 0 disables the
    /// limiter.
    pub request_rate_limit: u32,
}

impl Default for ResourceCaps {
    fn default() -> Self {
        ResourceCaps {
            max_concurrent_streams: 256,
            max_message_bytes: 4 * 1024 * 1024,
            max_watches_per_node: 10_000,
            max_leases_per_node: 10_000,
            request_rate_limit: 0,
        }
    }
}

/// Server-facing configuration: what the upstream REPL-oriented `ConfigLoad`
/// never needed, since it talked to a local engine directly instead of
/// running a server other nodes and clients connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    version: u8,

    /// This node's id within the cluster. 0 lets a single-node deployment
    /// pick an arbitrary stable id at startup.
    pub node_id: u64,

    /// `id@peer_url` entries for every member, including this one.
    pub peers: Vec<String>,

    /// Address the gRPC server listens on for client traffic.
    pub client_listen_url: String,

    /// Address used for inter-member (Raft) traffic.
    pub peer_listen_url: String,

    pub engine: EngineKind,

    data_dir: Option<PathBuf>,

    /// Whether reads may be served via the lease-read fast path instead of
    /// a full read-index round trip.
    pub lease_read_enabled: bool,

    /// How long a lease-read grant remains valid once a heartbeat reaches
    /// quorum. Should be safely shorter than the Raft election timeout.
    pub lease_duration_millis: u64,

    pub election_timeout_millis: u64,

    pub caps: ResourceCaps,

    pub prompt: Option<String>,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            version: 0,
            node_id: 0,
            peers: Vec::new(),
            client_listen_url: "0.0.0.0:2379".to_string(),
            peer_listen_url: "0.0.0.0:2380".to_string(),
            engine: EngineKind::default(),
            data_dir: None,
            lease_read_enabled: true,
            lease_duration_millis: 2_000,
            election_timeout_millis: 1_000,
            caps: ResourceCaps::default(),
            prompt: Some(DEFAULT_PROMPT.to_string()),
        }
    }
}

impl ConfigLoad {
    /// Loads configuration from `path`, falling back to defaults for any
    /// field the file omits. A missing file is not an error -- it's treated
    /// the same as an empty one.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let cfg = confy::load_path(path)?;
        Ok(cfg)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    pub fn total_nodes(&self) -> usize {
        self.peers.len().max(1)
    }
}
