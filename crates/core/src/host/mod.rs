//! Host abstraction the relay engine runs on.
//!
//! A host owns connections to other peers and multiplexes labeled streams
//! over them. The relay only needs to open and accept streams by protocol id,
//! establish connections from peer addresses and hear about connection
//! changes; everything else about the transport stays behind this trait.

pub mod memory;
pub mod quic;
mod stream;

pub use memory::{MemoryHost, MemoryNetwork};
pub use quic::QuicHost;
pub use stream::{BoxedReader, BoxedWriter, Stream, StreamRead, StreamWrite};

use async_trait::async_trait;
use circuitnet_common::{NetworkAddress, PeerId, PeerInfo};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Callback invoked with every inbound stream for a registered protocol.
///
/// Handlers are called on the host's accept path and must not block; spawn
/// a task for any I/O.
pub type StreamHandler = Arc<dyn Fn(Stream) + Send + Sync>;

/// Capacity of each host's connection event channel
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

#[async_trait]
pub trait Host: Send + Sync {
    /// Identity of this host
    fn local_peer(&self) -> PeerId;

    /// Addresses other peers can dial this host at
    fn listen_addresses(&self) -> Vec<NetworkAddress>;

    fn local_info(&self) -> PeerInfo {
        PeerInfo::with_addresses(self.local_peer(), self.listen_addresses())
    }

    /// Whether a live connection to `peer` exists
    fn is_connected(&self, peer: &PeerId) -> bool;

    fn connected_peers(&self) -> Vec<PeerId>;

    /// Establish a connection using the supplied addresses. Succeeds
    /// immediately when already connected.
    async fn connect(&self, peer: &PeerInfo) -> Result<(), HostError>;

    /// Open a new stream to a connected peer speaking `protocol`
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<Stream, HostError>;

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    fn remove_stream_handler(&self, protocol: &str);

    /// Subscribe to connection events
    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;
}

/// Transport-level failures
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("not connected to {0}")]
    NotConnected(PeerId),

    #[error("no known addresses for {0}")]
    NoAddresses(PeerId),

    #[error("{peer} does not support protocol {protocol}")]
    ProtocolNotSupported { peer: PeerId, protocol: String },

    #[error("failed to dial {peer}: {reason}")]
    DialFailed { peer: PeerId, reason: String },

    #[error("expected peer {expected}, reached {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },

    #[error("identity handshake failed: {0}")]
    Handshake(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("host is closed")]
    Closed,
}
