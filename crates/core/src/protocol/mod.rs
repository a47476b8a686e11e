//! Relay wire protocol: message types and framing

pub mod codec;
pub mod messages;

pub use codec::{read_frame, write_frame, CodecError, MessageCodec};
pub use messages::{DescriptorError, MessageType, PeerDescriptor, RelayMessage, StatusCode};
