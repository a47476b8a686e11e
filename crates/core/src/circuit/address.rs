//! Circuit addresses.
//!
//! A circuit address names a destination reached through a relay:
//!
//! * `/p2p/<relay>/p2p-circuit/p2p/<destination>` with a specific relay
//! * `/ip4/1.2.3.4/udp/4050/quic/p2p/<relay>/p2p-circuit/p2p/<destination>`
//!   which also tells the dialer where the relay is
//! * `/p2p-circuit/p2p/<destination>` leaving the relay to be chosen
//!
//! The destination part may carry addresses of its own, which an active relay
//! uses to reach it. A part with several addresses repeats the
//! `<address>/p2p/<id>` prefix once per address. `/ipfs/` is accepted wherever
//! `/p2p/` is.

use circuitnet_common::{types::split_segments, AddressError, NetworkAddress, PeerId, PeerInfo};
use std::fmt;
use std::str::FromStr;

/// Segment separating the relay part from the destination part
pub const CIRCUIT_SEGMENT: &str = "p2p-circuit";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitAddress {
    /// Relay to go through; `None` lets the dialer pick one
    pub relay: Option<PeerId>,
    pub relay_addrs: Vec<NetworkAddress>,
    pub destination: PeerId,
    pub destination_addrs: Vec<NetworkAddress>,
}

impl CircuitAddress {
    /// Address reaching `destination` through a specific relay
    pub fn via(relay: &PeerInfo, destination: PeerId) -> Self {
        Self {
            relay: Some(relay.id),
            relay_addrs: relay.addresses.clone(),
            destination,
            destination_addrs: Vec::new(),
        }
    }

    /// Address reaching `destination` through any hop-capable peer
    pub fn unspecified(destination: PeerId) -> Self {
        Self {
            relay: None,
            relay_addrs: Vec::new(),
            destination,
            destination_addrs: Vec::new(),
        }
    }

    pub fn with_destination_addrs(mut self, addrs: Vec<NetworkAddress>) -> Self {
        self.destination_addrs = addrs;
        self
    }

    pub fn relay_info(&self) -> Option<PeerInfo> {
        self.relay
            .map(|id| PeerInfo::with_addresses(id, self.relay_addrs.clone()))
    }

    pub fn destination_info(&self) -> PeerInfo {
        PeerInfo::with_addresses(self.destination, self.destination_addrs.clone())
    }

    /// Whether `s` parses as a circuit address
    pub fn is_circuit_address(s: &str) -> bool {
        s.parse::<Self>().is_ok()
    }
}

/// Every address of a part gets its own `<address>/p2p/<id>` prefix
impl fmt::Display for CircuitAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(relay) = &self.relay {
            write_peer_part(f, relay, &self.relay_addrs)?;
        }
        write!(f, "/{}", CIRCUIT_SEGMENT)?;
        write_peer_part(f, &self.destination, &self.destination_addrs)
    }
}

fn write_peer_part(f: &mut fmt::Formatter<'_>, id: &PeerId, addrs: &[NetworkAddress]) -> fmt::Result {
    if addrs.is_empty() {
        return write!(f, "/p2p/{}", id);
    }
    for address in addrs {
        write!(f, "{}/p2p/{}", address, id)?;
    }
    Ok(())
}

/// Parse `/p2p/<id>` or one or more `<address>/p2p/<id>` prefixes naming the
/// same peer
fn parse_peer_part(segments: &[&str]) -> Result<PeerInfo, AddressError> {
    let mut info: Option<PeerInfo> = None;
    let mut rest = segments;

    while !rest.is_empty() {
        let (address, consumed) = match rest[0] {
            "p2p" | "ipfs" => (None, 0),
            _ => {
                let (address, consumed) = NetworkAddress::from_segments(rest)?;
                (Some(address), consumed)
            }
        };
        match rest.get(consumed) {
            Some(&"p2p") | Some(&"ipfs") => {}
            Some(other) => return Err(AddressError::UnknownProtocol(other.to_string())),
            None => return Err(AddressError::MissingPeerId),
        }
        let id_str = rest
            .get(consumed + 1)
            .ok_or(AddressError::MissingValue("p2p"))?;
        let id = PeerId::from_hex(id_str)?;

        let entry = info.get_or_insert_with(|| PeerInfo::new(id));
        if entry.id != id {
            return Err(AddressError::InvalidValue {
                protocol: "p2p",
                value: id_str.to_string(),
            });
        }
        if let Some(address) = address {
            entry.add_address(address);
        }
        rest = &rest[consumed + 2..];
    }

    info.ok_or(AddressError::MissingPeerId)
}

impl FromStr for CircuitAddress {
    type Err = CircuitAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = split_segments(s).map_err(CircuitAddressError::Relay)?;
        let split = segments
            .iter()
            .position(|segment| *segment == CIRCUIT_SEGMENT)
            .ok_or_else(|| CircuitAddressError::NotCircuit(s.to_string()))?;

        let (relay_part, destination_part) = (&segments[..split], &segments[split + 1..]);

        let relay = if relay_part.is_empty() {
            None
        } else {
            Some(parse_peer_part(relay_part).map_err(CircuitAddressError::Relay)?)
        };

        let destination =
            parse_peer_part(destination_part).map_err(CircuitAddressError::Destination)?;

        if relay.as_ref().is_some_and(|relay| relay.id == destination.id) {
            return Err(CircuitAddressError::RelayIsDestination);
        }

        Ok(Self {
            relay: relay.as_ref().map(|relay| relay.id),
            relay_addrs: relay.map(|relay| relay.addresses).unwrap_or_default(),
            destination: destination.id,
            destination_addrs: destination.addresses,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitAddressError {
    #[error("not a circuit address: {0}")]
    NotCircuit(String),

    #[error("invalid relay part: {0}")]
    Relay(AddressError),

    #[error("invalid destination part: {0}")]
    Destination(AddressError),

    #[error("relay and destination are the same peer")]
    RelayIsDestination,
}
