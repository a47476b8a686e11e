use circuitnet_common::{NetworkAddress, PeerId, PeerInfo};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a relay protocol message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Source asks a relay to open a circuit
    Hop,
    /// Relay asks the destination to accept a circuit
    Stop,
    /// Reply carrying a status code
    Status,
    /// Capability probe
    CanHop,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hop => "HOP",
            Self::Stop => "STOP",
            Self::Status => "STATUS",
            Self::CanHop => "CAN_HOP",
        };
        f.write_str(name)
    }
}

/// Outcome of a relay handshake step.
///
/// Numeric values are stable and travel on the wire; a value outside this set
/// fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
#[repr(u16)]
pub enum StatusCode {
    Success = 100,
    HopSrcAddrTooLong = 220,
    HopDstAddrTooLong = 221,
    HopSrcMultiaddrInvalid = 250,
    HopDstMultiaddrInvalid = 251,
    HopNoConnToDst = 260,
    HopCantDialDst = 261,
    HopCantOpenDstStream = 262,
    HopCantSpeakRelay = 270,
    HopCantRelayToSelf = 280,
    StopSrcAddrTooLong = 320,
    StopDstAddrTooLong = 321,
    StopSrcMultiaddrInvalid = 350,
    StopDstMultiaddrInvalid = 351,
    StopRelayRefused = 390,
    MalformedMessage = 400,
}

impl StatusCode {
    pub const ALL: [StatusCode; 16] = [
        Self::Success,
        Self::HopSrcAddrTooLong,
        Self::HopDstAddrTooLong,
        Self::HopSrcMultiaddrInvalid,
        Self::HopDstMultiaddrInvalid,
        Self::HopNoConnToDst,
        Self::HopCantDialDst,
        Self::HopCantOpenDstStream,
        Self::HopCantSpeakRelay,
        Self::HopCantRelayToSelf,
        Self::StopSrcAddrTooLong,
        Self::StopDstAddrTooLong,
        Self::StopSrcMultiaddrInvalid,
        Self::StopDstMultiaddrInvalid,
        Self::StopRelayRefused,
        Self::MalformedMessage,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Protocol name of the code, as it appears in logs and errors
    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::HopSrcAddrTooLong => "HOP_SRC_ADDR_TOO_LONG",
            Self::HopDstAddrTooLong => "HOP_DST_ADDR_TOO_LONG",
            Self::HopSrcMultiaddrInvalid => "HOP_SRC_MULTIADDR_INVALID",
            Self::HopDstMultiaddrInvalid => "HOP_DST_MULTIADDR_INVALID",
            Self::HopNoConnToDst => "HOP_NO_CONN_TO_DST",
            Self::HopCantDialDst => "HOP_CANT_DIAL_DST",
            Self::HopCantOpenDstStream => "HOP_CANT_OPEN_DST_STREAM",
            Self::HopCantSpeakRelay => "HOP_CANT_SPEAK_RELAY",
            Self::HopCantRelayToSelf => "HOP_CANT_RELAY_TO_SELF",
            Self::StopSrcAddrTooLong => "STOP_SRC_ADDR_TOO_LONG",
            Self::StopDstAddrTooLong => "STOP_DST_ADDR_TOO_LONG",
            Self::StopSrcMultiaddrInvalid => "STOP_SRC_MULTIADDR_INVALID",
            Self::StopDstMultiaddrInvalid => "STOP_DST_MULTIADDR_INVALID",
            Self::StopRelayRefused => "STOP_RELAY_REFUSED",
            Self::MalformedMessage => "MALFORMED_MESSAGE",
        }
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> Self {
        code.as_u16()
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|code| code.as_u16() == value)
            .ok_or_else(|| format!("unknown relay status code {}", value))
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u16())
    }
}

/// A peer as it travels inside HOP and STOP messages.
///
/// Fields stay raw until the receiver validates them, so a malformed id or
/// address can be answered with the matching status code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: Vec<u8>,
    /// Text multiaddr forms, one per address
    pub addrs: Vec<Vec<u8>>,
}

/// Why a descriptor could not be turned into a [`PeerInfo`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("invalid peer id: {0}")]
    PeerId(String),

    #[error("invalid address: {0}")]
    Address(String),
}

impl PeerDescriptor {
    pub fn from_peer_info(info: &PeerInfo) -> Self {
        Self {
            id: info.id.as_bytes().to_vec(),
            addrs: info
                .addresses
                .iter()
                .map(|address| address.to_string().into_bytes())
                .collect(),
        }
    }

    /// Length of the longest encoded address
    pub fn longest_addr(&self) -> usize {
        self.addrs.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn to_peer_info(&self) -> Result<PeerInfo, DescriptorError> {
        let id = PeerId::from_slice(&self.id).map_err(|e| DescriptorError::PeerId(e.to_string()))?;

        let addresses = self
            .addrs
            .iter()
            .map(|raw| {
                let text = std::str::from_utf8(raw)
                    .map_err(|_| DescriptorError::Address("not utf-8".to_string()))?;
                text.parse::<NetworkAddress>()
                    .map_err(|e| DescriptorError::Address(format!("{}: {}", text, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PeerInfo::with_addresses(id, addresses))
    }
}

impl From<&PeerInfo> for PeerDescriptor {
    fn from(info: &PeerInfo) -> Self {
        Self::from_peer_info(info)
    }
}

/// A relay protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub kind: MessageType,
    pub src_peer: Option<PeerDescriptor>,
    pub dst_peer: Option<PeerDescriptor>,
    pub code: Option<StatusCode>,
}

impl RelayMessage {
    pub fn hop(src: &PeerInfo, dst: &PeerInfo) -> Self {
        Self {
            kind: MessageType::Hop,
            src_peer: Some(src.into()),
            dst_peer: Some(dst.into()),
            code: None,
        }
    }

    /// STOP forwarding the descriptors exactly as the source sent them
    pub fn stop(src: PeerDescriptor, dst: PeerDescriptor) -> Self {
        Self {
            kind: MessageType::Stop,
            src_peer: Some(src),
            dst_peer: Some(dst),
            code: None,
        }
    }

    pub fn status(code: StatusCode) -> Self {
        Self {
            kind: MessageType::Status,
            src_peer: None,
            dst_peer: None,
            code: Some(code),
        }
    }

    pub fn can_hop() -> Self {
        Self {
            kind: MessageType::CanHop,
            src_peer: None,
            dst_peer: None,
            code: None,
        }
    }

    /// Status code of a STATUS message; `None` for any other kind or a
    /// STATUS without a code
    pub fn status_code(&self) -> Option<StatusCode> {
        match self.kind {
            MessageType::Status => self.code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_values() {
        assert_eq!(StatusCode::Success.as_u16(), 100);
        assert_eq!(StatusCode::HopCantSpeakRelay.as_u16(), 270);
        assert_eq!(StatusCode::StopRelayRefused.as_u16(), 390);
        assert_eq!(StatusCode::MalformedMessage.as_u16(), 400);
        assert_eq!(StatusCode::try_from(262), Ok(StatusCode::HopCantOpenDstStream));
        assert!(StatusCode::try_from(263).is_err());
    }

    #[test]
    fn test_status_code_display() {
        assert_eq!(
            StatusCode::HopNoConnToDst.to_string(),
            "HOP_NO_CONN_TO_DST (260)"
        );
    }

    #[test]
    fn test_unknown_code_fails_to_decode() {
        let mut encoded = bincode::serialize(&RelayMessage::status(StatusCode::Success)).unwrap();
        // The code is the trailing u16
        let len = encoded.len();
        encoded[len - 2..].copy_from_slice(&999u16.to_le_bytes());
        assert!(bincode::deserialize::<RelayMessage>(&encoded).is_err());
    }

    #[test]
    fn test_descriptor_to_peer_info() {
        let info = PeerInfo::with_addresses(
            PeerId::from([3u8; 32]),
            vec!["/ip4/127.0.0.1/udp/4050/quic".parse().unwrap()],
        );
        let descriptor = PeerDescriptor::from_peer_info(&info);
        assert_eq!(descriptor.addrs[0], b"/ip4/127.0.0.1/udp/4050/quic");
        assert_eq!(descriptor.to_peer_info().unwrap(), info);
    }

    #[test]
    fn test_descriptor_rejects_garbage() {
        let bad_id = PeerDescriptor {
            id: vec![1, 2, 3],
            addrs: Vec::new(),
        };
        assert!(matches!(bad_id.to_peer_info(), Err(DescriptorError::PeerId(_))));

        let bad_addr = PeerDescriptor {
            id: vec![0u8; 32],
            addrs: vec![b"/tcp/nope".to_vec()],
        };
        assert!(matches!(
            bad_addr.to_peer_info(),
            Err(DescriptorError::Address(_))
        ));
        assert_eq!(bad_addr.longest_addr(), 9);
    }

    #[test]
    fn test_status_code_accessor() {
        assert_eq!(
            RelayMessage::status(StatusCode::HopCantDialDst).status_code(),
            Some(StatusCode::HopCantDialDst)
        );
        assert_eq!(RelayMessage::can_hop().status_code(), None);
    }
}
