use circuitnet_common::{PeerId, PeerInfo};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use super::address::CircuitAddress;
use super::conn::RelayedConn;
use super::error::CircuitError;
use super::relay::{Deadline, Relay};

/// Dials circuit addresses, choosing a relay when the address leaves it open
#[derive(Clone)]
pub struct CircuitDialer {
    relay: Relay,
}

impl CircuitDialer {
    pub(super) fn new(relay: Relay) -> Self {
        Self { relay }
    }

    /// Whether `addr` is something this dialer can dial
    pub fn can_dial(&self, addr: &str) -> bool {
        CircuitAddress::is_circuit_address(addr)
    }

    pub async fn dial(&self, addr: &CircuitAddress) -> Result<RelayedConn, CircuitError> {
        self.dial_timeout(addr, self.relay.config().dial_timeout)
            .await
    }

    /// Parse and dial a textual circuit address
    pub async fn dial_str(&self, addr: &str) -> Result<RelayedConn, CircuitError> {
        let addr: CircuitAddress = addr.parse()?;
        self.dial(&addr).await
    }

    /// Dial `addr`, with relay selection and the circuit handshake sharing
    /// one deadline
    pub async fn dial_timeout(
        &self,
        addr: &CircuitAddress,
        limit: Duration,
    ) -> Result<RelayedConn, CircuitError> {
        let deadline = Deadline::after(limit);
        let dest = addr.destination_info();

        match addr.relay_info() {
            Some(relay) => self.relay.inner().dial_peer(&relay, &dest, deadline).await,
            None => self.dial_any_relay(&dest, deadline).await,
        }
    }

    /// Try known relays first, then probe the remaining connected peers
    async fn dial_any_relay(
        &self,
        dest: &PeerInfo,
        deadline: Deadline,
    ) -> Result<RelayedConn, CircuitError> {
        let inner = self.relay.inner();
        let host = &inner.host;
        let mut tried: HashSet<PeerId> = HashSet::new();

        let mut known: Vec<PeerId> = inner
            .known_relays()
            .into_iter()
            .filter(|peer| *peer != dest.id && host.is_connected(peer))
            .collect();
        known.shuffle(&mut rand::thread_rng());

        for peer in known {
            tried.insert(peer);
            match inner.dial_peer(&PeerInfo::new(peer), dest, deadline).await {
                Ok(conn) => return Ok(conn),
                Err(e @ CircuitError::Timeout(_)) => return Err(e),
                Err(e) => debug!("Dial through known relay {} failed: {}", peer.short_hex(), e),
            }
        }

        let mut candidates: Vec<PeerId> = host
            .connected_peers()
            .into_iter()
            .filter(|peer| *peer != dest.id && !tried.contains(peer))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        for peer in candidates {
            match inner.can_hop(&peer, deadline).await {
                Ok(true) => inner.add_known_relay(peer),
                Ok(false) => continue,
                Err(e @ CircuitError::Timeout(_)) => return Err(e),
                Err(e) => {
                    debug!("Relay probe of {} failed: {}", peer.short_hex(), e);
                    continue;
                }
            }

            tried.insert(peer);
            match inner.dial_peer(&PeerInfo::new(peer), dest, deadline).await {
                Ok(conn) => return Ok(conn),
                Err(e @ CircuitError::Timeout(_)) => return Err(e),
                Err(e) => debug!("Dial through {} failed: {}", peer.short_hex(), e),
            }
        }

        Err(CircuitError::NoUsableRelay {
            destination: dest.id,
            tried: tried.len(),
        })
    }
}
