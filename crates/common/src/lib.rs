pub mod config;
pub mod error;
pub mod peer_info;
pub mod types;

pub use config::{protocol, relay, ConfigError, NodeConfig, RelayConfig};
pub use error::AddressError;
pub use peer_info::PeerInfo;
pub use types::NetworkAddress;

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub const PEER_ID_LEN: usize = 32;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("invalid peer id length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid peer id hex: {0}")]
    InvalidHex(String),
}

/// Identity of a peer on the network.
///
/// The text form is lowercase hex; hosts derive it from the peer's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, PeerIdError> {
        if bytes.len() != PEER_ID_LEN {
            return Err(PeerIdError::InvalidLength {
                expected: PEER_ID_LEN,
                actual: bytes.len(),
            });
        }

        let mut array = [0u8; PEER_ID_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, PeerIdError> {
        let decoded =
            hex::decode(hex_str).map_err(|err| PeerIdError::InvalidHex(err.to_string()))?;
        Self::from_slice(&decoded)
    }

    /// First 8 bytes as hex, for log lines
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}...)", self.short_hex())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; PEER_ID_LEN]> for PeerId {
    fn from(value: [u8; PEER_ID_LEN]) -> Self {
        Self::from_bytes(value)
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = PeerIdError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_slice(value)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
