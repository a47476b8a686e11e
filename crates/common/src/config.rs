use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::PeerInfo;

/// Wire protocol constants
pub mod protocol {
    /// Protocol id relay streams are opened with
    pub const PROTOCOL_ID: &str = "/libp2p/circuit/relay/0.1.0";

    /// Maximum encoded size of a single relay message frame
    pub const MAX_MESSAGE_SIZE: usize = 4096;

    /// Maximum encoded length of one address inside a peer descriptor
    pub const MAX_ADDR_LEN: usize = 1024;

    /// Default UDP port for the QUIC host
    pub const DEFAULT_PORT: u16 = 4050;

    /// Identity handshake timeout for new host connections
    pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

    /// Time a newly accepted stream has to name its protocol
    pub const STREAM_NEGOTIATION_TIMEOUT_SECS: u64 = 10;
}

/// Relay timing and sizing defaults
pub mod relay {
    /// Bound on dialing and opening a stream to a destination (hop role)
    pub const HOP_CONNECT_TIMEOUT_SECS: u64 = 30;

    /// Bound on reading a request and on awaiting the destination's status
    pub const STOP_HANDSHAKE_TIMEOUT_SECS: u64 = 60;

    /// Bound on a whole source-side dial or capability probe
    pub const DIAL_TIMEOUT_SECS: u64 = 60;

    /// How long a stop request waits for room in the accept queue
    pub const ACCEPT_TIMEOUT_SECS: u64 = 60;

    /// Pending relayed connections a listener buffers
    pub const ACCEPT_BACKLOG: usize = 32;

    /// Copy buffer used per splice direction
    pub const SPLICE_BUFFER_SIZE: usize = 16 * 1024;
}

/// Relay capabilities and timeouts.
///
/// Immutable once handed to a relay; build it with the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay traffic for other peers
    pub hop: bool,

    /// When relaying, dial destinations that are not yet connected
    pub active: bool,

    /// Probe newly connected peers for hop capability
    pub discover_relays: bool,

    #[serde(rename = "dial_timeout_ms", with = "duration_ms")]
    pub dial_timeout: Duration,

    #[serde(rename = "hop_connect_timeout_ms", with = "duration_ms")]
    pub hop_connect_timeout: Duration,

    #[serde(rename = "stop_handshake_timeout_ms", with = "duration_ms")]
    pub stop_handshake_timeout: Duration,

    #[serde(rename = "accept_timeout_ms", with = "duration_ms")]
    pub accept_timeout: Duration,

    pub accept_backlog: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hop: false,
            active: false,
            discover_relays: true,
            dial_timeout: Duration::from_secs(relay::DIAL_TIMEOUT_SECS),
            hop_connect_timeout: Duration::from_secs(relay::HOP_CONNECT_TIMEOUT_SECS),
            stop_handshake_timeout: Duration::from_secs(relay::STOP_HANDSHAKE_TIMEOUT_SECS),
            accept_timeout: Duration::from_secs(relay::ACCEPT_TIMEOUT_SECS),
            accept_backlog: relay::ACCEPT_BACKLOG,
        }
    }
}

impl RelayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hop(mut self, hop: bool) -> Self {
        self.hop = hop;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_discover_relays(mut self, discover: bool) -> Self {
        self.discover_relays = discover;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_hop_connect_timeout(mut self, timeout: Duration) -> Self {
        self.hop_connect_timeout = timeout;
        self
    }

    pub fn with_stop_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.stop_handshake_timeout = timeout;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog.max(1);
        self
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Socket address the QUIC host binds to
    pub listen_addr: String,

    /// Peers to connect to at startup, as `<address>/p2p/<id>`
    pub bootstrap_peers: Vec<String>,

    /// Directory holding the node identity
    pub data_dir: String,

    /// Accept relayed connections addressed to this node
    pub accept_relayed: bool,

    /// Relay capabilities of this node
    pub relay: RelayConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{}", protocol::DEFAULT_PORT),
            bootstrap_peers: Vec::new(),
            data_dir: "./data".to_string(),
            accept_relayed: true,
            relay: RelayConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_bootstrap_peers(mut self, peers: Vec<String>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<String>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("listen_addr: {}", self.listen_addr)))
    }

    pub fn bootstrap_peer_infos(&self) -> Result<Vec<PeerInfo>, ConfigError> {
        self.bootstrap_peers
            .iter()
            .map(|peer| {
                peer.parse::<PeerInfo>()
                    .map_err(|e| ConfigError::Invalid(format!("bootstrap peer {}: {}", peer, e)))
            })
            .collect()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
