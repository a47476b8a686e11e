use circuitnet_common::protocol::MAX_ADDR_LEN;
use circuitnet_common::{PeerId, PeerInfo};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use super::address::CircuitAddress;
use super::conn::RelayedConn;
use super::error::CircuitError;
use super::hop::refuse;
use super::relay::RelayInner;
use crate::host::Stream;
use crate::protocol::{MessageCodec, RelayMessage, StatusCode};

/// A circuit waiting for the application to accept it
pub(super) struct PendingConn {
    stream: Stream,
    source: PeerInfo,
    relay: PeerId,
}

/// Serve a STOP request forwarded by a relay
pub(super) async fn handle_stop(relay: &RelayInner, stream: Stream, message: RelayMessage) {
    let src = message.src_peer.unwrap_or_default();
    let dst = message.dst_peer.unwrap_or_default();

    if src.longest_addr() > MAX_ADDR_LEN {
        return refuse(stream, StatusCode::StopSrcAddrTooLong).await;
    }
    if dst.longest_addr() > MAX_ADDR_LEN {
        return refuse(stream, StatusCode::StopDstAddrTooLong).await;
    }

    let source = match src.to_peer_info() {
        Ok(info) => info,
        Err(e) => {
            debug!("Invalid source in STOP request: {}", e);
            return refuse(stream, StatusCode::StopSrcMultiaddrInvalid).await;
        }
    };
    if let Err(e) = dst.to_peer_info() {
        debug!("Invalid destination in STOP request: {}", e);
        return refuse(stream, StatusCode::StopDstMultiaddrInvalid).await;
    }

    let Some(sender) = relay.listener_sender() else {
        debug!("No relay listener for circuit from {}", source.id.short_hex());
        return refuse(stream, StatusCode::StopRelayRefused).await;
    };

    let permit = match timeout(relay.config.accept_timeout, sender.reserve()).await {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => {
            debug!("Relay listener closed");
            return refuse(stream, StatusCode::StopRelayRefused).await;
        }
        Err(_) => {
            debug!("Relay listener backlog full");
            return refuse(stream, StatusCode::StopRelayRefused).await;
        }
    };

    let relay_peer = stream.remote_peer();
    debug!(
        "Queued circuit from {} via {}",
        source.id.short_hex(),
        relay_peer.short_hex()
    );
    permit.send(PendingConn {
        stream,
        source,
        relay: relay_peer,
    });
}

/// Accepts circuits relayed to this host.
///
/// Only one listener is registered per relay at a time; registering another
/// closes this one. Dropping the listener closes it.
pub struct RelayListener {
    relay: Arc<RelayInner>,
    id: u64,
    incoming: mpsc::Receiver<PendingConn>,
    closed: bool,
}

impl RelayListener {
    pub(super) fn new(relay: Arc<RelayInner>, id: u64, incoming: mpsc::Receiver<PendingConn>) -> Self {
        Self {
            relay,
            id,
            incoming,
            closed: false,
        }
    }

    /// Wait for the next relayed connection.
    ///
    /// The destination's SUCCESS status is sent here, so it always reaches
    /// the relay ahead of anything written on the returned connection.
    pub async fn accept(&mut self) -> Result<RelayedConn, CircuitError> {
        loop {
            if self.closed {
                return Err(CircuitError::ListenerClosed);
            }
            let Some(pending) = self.incoming.recv().await else {
                self.closed = true;
                return Err(CircuitError::ListenerClosed);
            };

            let PendingConn {
                mut stream,
                source,
                relay,
            } = pending;

            match MessageCodec::send_message(&mut stream, &RelayMessage::status(StatusCode::Success)).await {
                Ok(()) => {
                    info!(
                        source = %source.id.short_hex(),
                        relay = %relay.short_hex(),
                        "Accepted relayed connection"
                    );
                    return Ok(RelayedConn::new(stream, source, relay));
                }
                Err(e) => {
                    debug!("Relayed connection from {} dropped before accept: {}", source.id.short_hex(), e);
                    stream.reset();
                }
            }
        }
    }

    /// Stop accepting. Circuits already queued are reset.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.relay.remove_listener(self.id);
        self.incoming.close();
        while let Ok(mut pending) = self.incoming.try_recv() {
            pending.stream.reset();
        }
        debug!("Relay listener {} closed", self.id);
    }

    /// Circuit address other peers can reach this host at
    pub fn local_address(&self) -> CircuitAddress {
        CircuitAddress::unspecified(self.relay.local_peer())
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        self.close();
    }
}
