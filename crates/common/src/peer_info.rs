use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AddressError;
use crate::types::{split_segments, NetworkAddress};
use crate::PeerId;

/// A peer identity together with the addresses it can be reached at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Identity of the peer
    pub id: PeerId,

    /// Network addresses where the peer can be reached
    pub addresses: Vec<NetworkAddress>,
}

impl PeerInfo {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            addresses: Vec::new(),
        }
    }

    pub fn with_addresses(id: PeerId, addresses: Vec<NetworkAddress>) -> Self {
        Self { id, addresses }
    }

    pub fn add_address(&mut self, address: NetworkAddress) {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
    }
}

impl From<PeerId> for PeerInfo {
    fn from(id: PeerId) -> Self {
        Self::new(id)
    }
}

/// Renders `<address>/p2p/<id>`, using the first address when there is one
impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(address) = self.addresses.first() {
            write!(f, "{}", address)?;
        }
        write!(f, "/p2p/{}", self.id)
    }
}

/// Parses `/p2p/<id>` or `<address>/p2p/<id>`; `/ipfs/` is accepted for `/p2p/`
impl FromStr for PeerInfo {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = split_segments(s)?;

        let (addresses, offset) = match segments.first() {
            Some(&"p2p") | Some(&"ipfs") => (Vec::new(), 0),
            Some(_) => {
                let (address, consumed) = NetworkAddress::from_segments(&segments)?;
                (vec![address], consumed)
            }
            None => return Err(AddressError::Empty),
        };

        match segments.get(offset) {
            Some(&"p2p") | Some(&"ipfs") => {}
            Some(other) => return Err(AddressError::UnknownProtocol(other.to_string())),
            None => return Err(AddressError::MissingPeerId),
        }
        let id_str = segments.get(offset + 1).ok_or(AddressError::MissingValue("p2p"))?;
        let id = PeerId::from_hex(id_str)?;

        if segments.len() > offset + 2 {
            return Err(AddressError::Trailing(segments[offset + 2..].join("/")));
        }

        Ok(Self { id, addresses })
    }
}
