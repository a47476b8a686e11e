//! Host over QUIC.
//!
//! Every new connection starts with an identity handshake on its first
//! bidirectional stream:
//!
//! 1. the dialer sends its public key and a random nonce
//! 2. the listener answers with its own key, a signature over the dialer's
//!    nonce and a nonce of its own
//! 3. the dialer proves its key by signing the listener's nonce
//!
//! Peer ids are derived from the exchanged keys. Every later stream opens with
//! a length-prefixed protocol id, which the accepting side acknowledges with a
//! single byte before the stream is handed to the protocol's handler.

use async_trait::async_trait;
use circuitnet_common::protocol::{HANDSHAKE_TIMEOUT_SECS, STREAM_NEGOTIATION_TIMEOUT_SECS};
use circuitnet_common::{NetworkAddress, PeerId, PeerInfo};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{Host, HostError, HostEvent, Stream, StreamHandler, EVENT_CHANNEL_CAPACITY};
use crate::identity::{Identity, PublicKey};
use crate::protocol::{read_frame, write_frame};
use crate::transport::{Connection, Endpoint, EndpointConfig, Incoming, RecvStream, SendStream};

/// Domain separation for handshake signatures
const HANDSHAKE_CONTEXT: &[u8] = b"circuitnet-handshake-v1";

const PROTOCOL_ACCEPTED: u8 = 1;
const PROTOCOL_REJECTED: u8 = 0;

#[derive(Debug, Serialize, Deserialize)]
enum Handshake {
    Hello {
        public_key: [u8; 32],
        nonce: [u8; 32],
    },
    Reply {
        public_key: [u8; 32],
        nonce: [u8; 32],
        signature: Vec<u8>,
    },
    Proof {
        signature: Vec<u8>,
    },
}

struct PeerConnection {
    connection: Connection,
    remote_addr: SocketAddr,
}

/// A host reachable at `/ip4/<ip>/udp/<port>/quic`
pub struct QuicHost {
    this: Weak<QuicHost>,
    identity: Identity,
    endpoint: Endpoint,
    connections: RwLock<HashMap<PeerId, PeerConnection>>,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    events: broadcast::Sender<HostEvent>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl QuicHost {
    /// Bind a QUIC endpoint and start accepting connections
    pub async fn bind(identity: Identity, bind_addr: SocketAddr) -> Result<Arc<Self>, HostError> {
        let endpoint = Endpoint::new(EndpointConfig::with_bind_addr(bind_addr))
            .await
            .map_err(|e| HostError::Stream(e.to_string()))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let host = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            identity,
            endpoint,
            connections: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            events,
            accept_task: Mutex::new(None),
        });

        let accept_task = tokio::spawn(accept_loop(host.endpoint.clone(), Arc::downgrade(&host)));
        *host.accept_task.lock() = Some(accept_task);

        info!(
            "QUIC host {} listening on {}",
            host.identity.peer_id().short_hex(),
            host.endpoint.local_addr()
        );
        Ok(host)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Close every connection and stop accepting new ones
    pub fn close(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let peers: Vec<PeerId> = self.connections.read().keys().copied().collect();
        for peer in peers {
            self.disconnect(&peer);
        }
        self.endpoint.close();
    }

    /// Close the connection to `peer`
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        let Some(entry) = self.connections.write().remove(peer) else {
            return false;
        };
        entry.connection.close(0, "disconnect");
        let _ = self.events.send(HostEvent::Disconnected(*peer));
        true
    }

    /// Socket address of the connection to `peer`
    pub fn peer_addr(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.connections.read().get(peer).map(|entry| entry.remote_addr)
    }

    fn connection(&self, peer: &PeerId) -> Option<Connection> {
        self.connections
            .read()
            .get(peer)
            .map(|entry| entry.connection.clone())
    }

    /// Record an authenticated connection and start serving its streams
    fn register(&self, peer: PeerId, connection: Connection) {
        let remote_addr = connection.remote_addr();
        let previous = self.connections.write().insert(
            peer,
            PeerConnection {
                connection: connection.clone(),
                remote_addr,
            },
        );
        if let Some(previous) = previous {
            previous.connection.close(0, "replaced");
        }

        info!("Connected to {} at {}", peer.short_hex(), remote_addr);
        let _ = self.events.send(HostEvent::Connected(peer));

        tokio::spawn(serve_connection(self.this.clone(), peer, connection));
    }

    /// Forget `connection` if it is still the one registered for `peer`
    fn connection_closed(&self, peer: PeerId, connection: &Connection) {
        let removed = {
            let mut connections = self.connections.write();
            match connections.get(&peer) {
                Some(entry) if entry.connection.stable_id() == connection.stable_id() => {
                    connections.remove(&peer);
                    true
                }
                _ => false,
            }
        };
        if removed {
            info!("Disconnected from {}", peer.short_hex());
            let _ = self.events.send(HostEvent::Disconnected(peer));
        }
    }

    async fn resolve(peer: &PeerInfo) -> Vec<SocketAddr> {
        let mut resolved = Vec::new();
        for address in &peer.addresses {
            match address {
                NetworkAddress::Socket(addr) => resolved.push(*addr),
                NetworkAddress::Domain { host, port } => {
                    match tokio::net::lookup_host((host.as_str(), *port)).await {
                        Ok(addrs) => resolved.extend(addrs),
                        Err(e) => debug!("Failed to resolve {}: {}", host, e),
                    }
                }
                NetworkAddress::Memory(_) => {}
            }
        }
        resolved
    }

    /// Dial one address and authenticate the peer behind it
    async fn dial(&self, addr: SocketAddr, expected: PeerId) -> Result<Connection, HostError> {
        let connection = self
            .endpoint
            .connect(addr)
            .await
            .map_err(|e| HostError::DialFailed {
                peer: expected,
                reason: e.to_string(),
            })?;

        let handshake = timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            initiate_handshake(&self.identity, &connection),
        )
        .await
        .map_err(|_| HostError::Handshake("timed out".to_string()))
        .and_then(|result| result);

        match handshake {
            Ok(actual) if actual == expected => Ok(connection),
            Ok(actual) => {
                connection.close(0, "unexpected peer");
                Err(HostError::PeerIdMismatch { expected, actual })
            }
            Err(e) => {
                connection.close(0, "handshake failed");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Host for QuicHost {
    fn local_peer(&self) -> PeerId {
        self.identity.peer_id()
    }

    fn listen_addresses(&self) -> Vec<NetworkAddress> {
        vec![NetworkAddress::from_socket(self.endpoint.local_addr())]
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections
            .read()
            .get(peer)
            .is_some_and(|entry| !entry.connection.is_closed())
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.read().keys().copied().collect()
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), HostError> {
        if self.is_connected(&peer.id) {
            return Ok(());
        }
        if peer.id == self.local_peer() {
            return Err(HostError::DialFailed {
                peer: peer.id,
                reason: "cannot dial self".to_string(),
            });
        }
        if peer.addresses.is_empty() {
            return Err(HostError::NoAddresses(peer.id));
        }

        let candidates = Self::resolve(peer).await;
        let mut last_error = HostError::DialFailed {
            peer: peer.id,
            reason: "no QUIC address".to_string(),
        };

        for addr in candidates {
            debug!("Dialing {} at {}", peer.id.short_hex(), addr);
            match self.dial(addr, peer.id).await {
                Ok(connection) => {
                    self.register(peer.id, connection);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Dial of {} at {} failed: {}", peer.id.short_hex(), addr, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<Stream, HostError> {
        let connection = self.connection(peer).ok_or(HostError::NotConnected(*peer))?;

        let negotiate = async {
            let (mut send, mut recv) = connection
                .open_bi()
                .await
                .map_err(|e| HostError::Stream(e.to_string()))?;

            write_frame(&mut send, &protocol.to_string())
                .await
                .map_err(|e| HostError::Stream(e.to_string()))?;

            let ack = recv
                .read_u8()
                .await
                .map_err(|e| HostError::Stream(e.to_string()))?;
            if ack != PROTOCOL_ACCEPTED {
                return Err(HostError::ProtocolNotSupported {
                    peer: *peer,
                    protocol: protocol.to_string(),
                });
            }

            Ok(Stream::new(recv, send, *peer, protocol))
        };

        timeout(Duration::from_secs(STREAM_NEGOTIATION_TIMEOUT_SECS), negotiate)
            .await
            .map_err(|_| HostError::Stream(format!("negotiating {} timed out", protocol)))?
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        self.handlers.write().insert(protocol.to_string(), handler);
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.handlers.write().remove(protocol);
    }

    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }
}

impl Drop for QuicHost {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
        self.endpoint.close();
    }
}

async fn accept_loop(endpoint: Endpoint, host: Weak<QuicHost>) {
    loop {
        let incoming = match endpoint.accept().await {
            Ok(incoming) => incoming,
            Err(e) => {
                debug!("Stopped accepting connections: {}", e);
                break;
            }
        };
        if host.strong_count() == 0 {
            break;
        }
        tokio::spawn(handle_incoming(host.clone(), incoming));
    }
}

async fn handle_incoming(host: Weak<QuicHost>, incoming: Incoming) {
    let remote_addr = incoming.remote_addr();
    let connection = match incoming.establish().await {
        Ok(connection) => connection,
        Err(e) => {
            debug!("Incoming connection from {} failed: {}", remote_addr, e);
            return;
        }
    };

    let Some(identity) = host.upgrade().map(|host| host.identity.clone()) else {
        return;
    };
    let handshake = timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        respond_handshake(&identity, &connection),
    )
    .await;

    match handshake {
        Ok(Ok(peer)) => {
            if let Some(host) = host.upgrade() {
                host.register(peer, connection);
            }
        }
        Ok(Err(e)) => {
            warn!("Handshake with {} failed: {}", remote_addr, e);
            connection.close(0, "handshake failed");
        }
        Err(_) => {
            warn!("Handshake with {} timed out", remote_addr);
            connection.close(0, "handshake timeout");
        }
    }
}

/// Accept streams on an authenticated connection until it closes
async fn serve_connection(host: Weak<QuicHost>, peer: PeerId, connection: Connection) {
    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                debug!("Connection to {} ended: {}", peer.short_hex(), e);
                break;
            }
        };
        let host = host.clone();
        tokio::spawn(async move {
            if let Err(e) = negotiate_inbound(host, peer, send, recv).await {
                debug!("Inbound stream from {} dropped: {}", peer.short_hex(), e);
            }
        });
    }

    if let Some(host) = host.upgrade() {
        host.connection_closed(peer, &connection);
    }
}

async fn negotiate_inbound(
    host: Weak<QuicHost>,
    peer: PeerId,
    mut send: SendStream,
    mut recv: RecvStream,
) -> Result<(), HostError> {
    let protocol: String = timeout(
        Duration::from_secs(STREAM_NEGOTIATION_TIMEOUT_SECS),
        read_frame(&mut recv),
    )
    .await
    .map_err(|_| HostError::Stream("protocol negotiation timed out".to_string()))?
    .map_err(|e| HostError::Stream(e.to_string()))?;

    let handler = host
        .upgrade()
        .ok_or(HostError::Closed)?
        .handlers
        .read()
        .get(&protocol)
        .cloned();

    let Some(handler) = handler else {
        send.write_u8(PROTOCOL_REJECTED)
            .await
            .map_err(|e| HostError::Stream(e.to_string()))?;
        let _ = send.shutdown().await;
        return Err(HostError::ProtocolNotSupported { peer, protocol });
    };

    send.write_u8(PROTOCOL_ACCEPTED)
        .await
        .map_err(|e| HostError::Stream(e.to_string()))?;
    handler(Stream::new(recv, send, peer, protocol));
    Ok(())
}

fn signed_payload(nonce: &[u8; 32]) -> Vec<u8> {
    let mut payload = HANDSHAKE_CONTEXT.to_vec();
    payload.extend_from_slice(nonce);
    payload
}

fn verify_signature(key: &PublicKey, nonce: &[u8; 32], signature: &[u8]) -> Result<(), HostError> {
    let signature: [u8; 64] = signature
        .try_into()
        .map_err(|_| HostError::Handshake("malformed signature".to_string()))?;
    if !key.verify(&signed_payload(nonce), &signature) {
        return Err(HostError::Handshake("bad signature".to_string()));
    }
    Ok(())
}

fn new_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn handshake_error(e: impl std::fmt::Display) -> HostError {
    HostError::Handshake(e.to_string())
}

/// Dialer side; returns the authenticated remote peer id
async fn initiate_handshake(identity: &Identity, connection: &Connection) -> Result<PeerId, HostError> {
    let (mut send, mut recv) = connection.open_bi().await.map_err(handshake_error)?;
    let nonce = new_nonce();

    let hello = Handshake::Hello {
        public_key: identity.public_key().as_bytes(),
        nonce,
    };
    write_frame(&mut send, &hello).await.map_err(handshake_error)?;

    let reply: Handshake = read_frame(&mut recv).await.map_err(handshake_error)?;
    let Handshake::Reply {
        public_key,
        nonce: their_nonce,
        signature,
    } = reply
    else {
        return Err(HostError::Handshake("expected reply".to_string()));
    };

    let remote_key = PublicKey::from_bytes(&public_key).map_err(handshake_error)?;
    verify_signature(&remote_key, &nonce, &signature)?;

    let proof = Handshake::Proof {
        signature: identity.sign(&signed_payload(&their_nonce)).to_vec(),
    };
    write_frame(&mut send, &proof).await.map_err(handshake_error)?;
    send.shutdown().await.map_err(handshake_error)?;

    Ok(remote_key.peer_id())
}

/// Listener side; returns the authenticated remote peer id
async fn respond_handshake(identity: &Identity, connection: &Connection) -> Result<PeerId, HostError> {
    let (mut send, mut recv) = connection.accept_bi().await.map_err(handshake_error)?;

    let hello: Handshake = read_frame(&mut recv).await.map_err(handshake_error)?;
    let Handshake::Hello {
        public_key,
        nonce: their_nonce,
    } = hello
    else {
        return Err(HostError::Handshake("expected hello".to_string()));
    };
    let remote_key = PublicKey::from_bytes(&public_key).map_err(handshake_error)?;

    let nonce = new_nonce();
    let reply = Handshake::Reply {
        public_key: identity.public_key().as_bytes(),
        nonce,
        signature: identity.sign(&signed_payload(&their_nonce)).to_vec(),
    };
    write_frame(&mut send, &reply).await.map_err(handshake_error)?;

    let proof: Handshake = read_frame(&mut recv).await.map_err(handshake_error)?;
    let Handshake::Proof { signature } = proof else {
        return Err(HostError::Handshake("expected proof".to_string()));
    };
    verify_signature(&remote_key, &nonce, &signature)?;
    let _ = send.shutdown().await;

    Ok(remote_key.peer_id())
}
