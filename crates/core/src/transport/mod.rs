/// QUIC transport backing [`QuicHost`](crate::host::QuicHost)
///
/// Provides encrypted, multiplexed connections:
/// - UDP-based, one connection per peer
/// - Bidirectional streams that map onto host streams
/// - Certificates are self-signed; peers authenticate with their own keys

mod connection;
mod endpoint;
mod stream;

pub use connection::{Connection, ConnectionError};
pub use endpoint::{Endpoint, EndpointConfig, EndpointError, Incoming};
pub use stream::{RecvStream, SendStream};
