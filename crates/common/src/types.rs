use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::AddressError;

/// Network address a host can be dialed at
///
/// Text form follows the multiaddr layout:
/// `/ip4/<ip>/udp/<port>/quic`, `/ip6/<ip>/udp/<port>/quic`,
/// `/dns/<host>/udp/<port>/quic` and `/memory/<n>` for in-process hosts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkAddress {
    /// Standard socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name + port (for DNS-based connections)
    Domain { host: String, port: u16 },
    /// In-process address used by memory networks
    Memory(u64),
}

impl NetworkAddress {
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self::Socket(addr)
    }

    pub fn from_domain(host: String, port: u16) -> Self {
        Self::Domain { host, port }
    }

    /// Parse a network address from the front of a segment list.
    ///
    /// Returns the address and the number of segments consumed, so callers
    /// can keep parsing peer or circuit components that follow it.
    pub fn from_segments(segments: &[&str]) -> Result<(Self, usize), AddressError> {
        let Some(head) = segments.first() else {
            return Err(AddressError::Empty);
        };

        match *head {
            "memory" => {
                let value = segments.get(1).ok_or(AddressError::MissingValue("memory"))?;
                let n = value.parse::<u64>().map_err(|_| AddressError::InvalidValue {
                    protocol: "memory",
                    value: value.to_string(),
                })?;
                Ok((Self::Memory(n), 2))
            }
            "ip4" | "ip6" | "dns" => {
                let protocol: &'static str = match *head {
                    "ip4" => "ip4",
                    "ip6" => "ip6",
                    _ => "dns",
                };
                let host = segments.get(1).ok_or(AddressError::MissingValue(protocol))?;

                match segments.get(2) {
                    Some(&"udp") => {}
                    Some(other) => return Err(AddressError::UnknownProtocol(other.to_string())),
                    None => return Err(AddressError::MissingValue("udp")),
                }
                let port_str = segments.get(3).ok_or(AddressError::MissingValue("udp"))?;
                let port = port_str.parse::<u16>().map_err(|_| AddressError::InvalidValue {
                    protocol: "udp",
                    value: port_str.to_string(),
                })?;

                let mut consumed = 4;
                if segments.get(4) == Some(&"quic") {
                    consumed += 1;
                }

                let address = if protocol == "dns" {
                    if host.is_empty() {
                        return Err(AddressError::MissingValue("dns"));
                    }
                    Self::Domain {
                        host: host.to_string(),
                        port,
                    }
                } else {
                    let ip = host.parse::<IpAddr>().map_err(|_| AddressError::InvalidValue {
                        protocol,
                        value: host.to_string(),
                    })?;
                    let matches_family = match ip {
                        IpAddr::V4(_) => protocol == "ip4",
                        IpAddr::V6(_) => protocol == "ip6",
                    };
                    if !matches_family {
                        return Err(AddressError::InvalidValue {
                            protocol,
                            value: host.to_string(),
                        });
                    }
                    Self::Socket(SocketAddr::new(ip, port))
                };

                Ok((address, consumed))
            }
            other => Err(AddressError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Split a multiaddr-style string into its segments, dropping the leading `/`
pub fn split_segments(s: &str) -> Result<Vec<&str>, AddressError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(AddressError::Empty);
    }
    let rest = s
        .strip_prefix('/')
        .ok_or_else(|| AddressError::MissingLeadingSlash(s.to_string()))?;
    Ok(rest.split('/').collect())
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket(SocketAddr::V4(addr)) => {
                write!(f, "/ip4/{}/udp/{}/quic", addr.ip(), addr.port())
            }
            Self::Socket(SocketAddr::V6(addr)) => {
                write!(f, "/ip6/{}/udp/{}/quic", addr.ip(), addr.port())
            }
            Self::Domain { host, port } => write!(f, "/dns/{}/udp/{}/quic", host, port),
            Self::Memory(n) => write!(f, "/memory/{}", n),
        }
    }
}

impl FromStr for NetworkAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = split_segments(s)?;
        let (address, consumed) = Self::from_segments(&segments)?;
        if consumed != segments.len() {
            return Err(AddressError::Trailing(segments[consumed..].join("/")));
        }
        Ok(address)
    }
}
