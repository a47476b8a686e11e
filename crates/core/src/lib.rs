pub mod circuit;
pub mod host;
pub mod identity;
pub mod protocol;
pub mod transport;

pub use identity::{ExportableIdentity, Identity, IdentityError, KeyPair, KeyPairError, PublicKey};

// Re-export circuit types
pub use circuit::{
    splice, CircuitAddress, CircuitAddressError, CircuitDialer, CircuitError, Relay, RelayError,
    RelayListener, RelayedConn, SpliceReport,
};

// Re-export host types
pub use host::{Host, HostError, HostEvent, MemoryHost, MemoryNetwork, QuicHost, Stream};

pub use protocol::{CodecError, MessageType, StatusCode};
