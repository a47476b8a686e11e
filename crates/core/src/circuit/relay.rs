use circuitnet_common::protocol::PROTOCOL_ID;
use circuitnet_common::{PeerId, PeerInfo, RelayConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::conn::RelayedConn;
use super::dialer::CircuitDialer;
use super::error::{CircuitError, RelayError};
use super::hop;
use super::listener::{PendingConn, RelayListener};
use crate::host::{Host, HostEvent, Stream, StreamHandler};
use crate::protocol::{CodecError, MessageCodec, MessageType, RelayMessage};

/// Circuit relay bound to a host.
///
/// Creating a relay registers the relay protocol on the host. Clones share the
/// same state; the protocol handler is removed when the last clone (and the
/// last listener) is dropped.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

pub(super) struct RelayInner {
    pub(super) host: Arc<dyn Host>,
    pub(super) config: RelayConfig,
    /// Queue of the registered listener, with its registration number
    listener: Mutex<Option<(u64, mpsc::Sender<PendingConn>)>>,
    next_listener: AtomicU64,
    known_relays: RwLock<HashSet<PeerId>>,
    tracker: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    pub fn new(host: Arc<dyn Host>, config: RelayConfig) -> Self {
        let inner = Arc::new(RelayInner {
            host,
            config,
            listener: Mutex::new(None),
            next_listener: AtomicU64::new(1),
            known_relays: RwLock::new(HashSet::new()),
            tracker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let handler: StreamHandler = Arc::new(move |mut stream: Stream| match weak.upgrade() {
            Some(relay) => {
                tokio::spawn(hop::handle_stream(relay, stream));
            }
            None => stream.reset(),
        });
        inner.host.set_stream_handler(PROTOCOL_ID, handler);

        if inner.config.discover_relays {
            let tracker = spawn_tracker(&inner);
            *inner.tracker.lock() = Some(tracker);
        }

        info!(
            peer = %inner.host.local_peer().short_hex(),
            hop = inner.config.hop,
            active = inner.config.active,
            "Circuit relay enabled"
        );

        Self { inner }
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.inner.host
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer()
    }

    /// Open a circuit to `dest` through `relay`, bounded by the configured
    /// dial timeout
    pub async fn dial_peer(
        &self,
        relay: &PeerInfo,
        dest: &PeerInfo,
    ) -> Result<RelayedConn, CircuitError> {
        self.dial_peer_timeout(relay, dest, self.inner.config.dial_timeout)
            .await
    }

    /// Open a circuit to `dest` through `relay` within `limit`.
    ///
    /// Connects to the relay first when not connected and `relay` carries
    /// addresses. A refusal by the relay or the destination comes back as
    /// [`CircuitError::Relay`]; running out of time as
    /// [`CircuitError::Timeout`].
    pub async fn dial_peer_timeout(
        &self,
        relay: &PeerInfo,
        dest: &PeerInfo,
        limit: Duration,
    ) -> Result<RelayedConn, CircuitError> {
        let deadline = Deadline::after(limit);
        self.inner.dial_peer(relay, dest, deadline).await
    }

    /// Ask `peer` whether it relays for others
    pub async fn can_hop(&self, peer: &PeerId) -> Result<bool, CircuitError> {
        let deadline = Deadline::after(self.inner.config.dial_timeout);
        self.inner.can_hop(peer, deadline).await
    }

    /// Start accepting circuits addressed to this host. Replaces any listener
    /// registered before.
    pub fn listener(&self) -> RelayListener {
        let (tx, rx) = mpsc::channel(self.inner.config.accept_backlog.max(1));
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        *self.inner.listener.lock() = Some((id, tx));
        debug!("Relay listener {} registered", id);
        RelayListener::new(self.inner.clone(), id, rx)
    }

    pub fn dialer(&self) -> CircuitDialer {
        CircuitDialer::new(self.clone())
    }

    /// Connected peers known to relay for others
    pub fn known_relays(&self) -> Vec<PeerId> {
        self.inner.known_relays()
    }

    pub(super) fn inner(&self) -> &Arc<RelayInner> {
        &self.inner
    }
}

/// Absolute end of an operation, remembering the budget it was built from
#[derive(Debug, Clone, Copy)]
pub(super) struct Deadline {
    pub(super) at: Instant,
    pub(super) budget: Duration,
}

impl Deadline {
    pub(super) fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    fn expired(&self) -> CircuitError {
        CircuitError::Timeout(self.budget)
    }
}

impl RelayInner {
    pub(super) fn local_peer(&self) -> PeerId {
        self.host.local_peer()
    }

    pub(super) fn known_relays(&self) -> Vec<PeerId> {
        self.known_relays.read().iter().copied().collect()
    }

    pub(super) fn add_known_relay(&self, peer: PeerId) {
        if self.known_relays.write().insert(peer) {
            debug!("Discovered relay {}", peer.short_hex());
        }
    }

    /// Sender of the registered listener, if any
    pub(super) fn listener_sender(&self) -> Option<mpsc::Sender<PendingConn>> {
        self.listener.lock().as_ref().map(|(_, tx)| tx.clone())
    }

    /// Unregister listener `id` unless it has been replaced already
    pub(super) fn remove_listener(&self, id: u64) {
        let mut slot = self.listener.lock();
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            *slot = None;
        }
    }

    pub(super) async fn dial_peer(
        &self,
        relay: &PeerInfo,
        dest: &PeerInfo,
        deadline: Deadline,
    ) -> Result<RelayedConn, CircuitError> {
        if !self.host.is_connected(&relay.id) && !relay.addresses.is_empty() {
            timeout_at(deadline.at, self.host.connect(relay))
                .await
                .map_err(|_| deadline.expired())??;
        }

        let mut stream = timeout_at(deadline.at, self.host.open_stream(&relay.id, PROTOCOL_ID))
            .await
            .map_err(|_| deadline.expired())??;

        let request = RelayMessage::hop(&self.host.local_info(), dest);
        let reply = match timeout_at(deadline.at, exchange(&mut stream, &request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                stream.reset();
                return Err(e.into());
            }
            Err(_) => {
                stream.reset();
                return Err(deadline.expired());
            }
        };

        match (reply.kind, reply.code) {
            (MessageType::Status, Some(code)) if code.is_success() => {
                debug!(
                    relay = %relay.id.short_hex(),
                    destination = %dest.id.short_hex(),
                    "Circuit established"
                );
                Ok(RelayedConn::new(stream, dest.clone(), relay.id))
            }
            (MessageType::Status, Some(code)) => {
                stream.reset();
                Err(RelayError::new(code).into())
            }
            (MessageType::Status, None) => {
                stream.reset();
                Err(CodecError::Decode("STATUS reply without a code".to_string()).into())
            }
            (kind, _) => {
                stream.reset();
                Err(CircuitError::UnexpectedResponse(kind))
            }
        }
    }

    pub(super) async fn can_hop(
        &self,
        peer: &PeerId,
        deadline: Deadline,
    ) -> Result<bool, CircuitError> {
        let mut stream = timeout_at(deadline.at, self.host.open_stream(peer, PROTOCOL_ID))
            .await
            .map_err(|_| deadline.expired())??;

        let reply = match timeout_at(deadline.at, exchange(&mut stream, &RelayMessage::can_hop())).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                stream.reset();
                return Err(e.into());
            }
            Err(_) => {
                stream.reset();
                return Err(deadline.expired());
            }
        };

        match reply.status_code() {
            Some(code) => Ok(code.is_success()),
            None => Err(CircuitError::UnexpectedResponse(reply.kind)),
        }
    }
}

impl Drop for RelayInner {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.lock().take() {
            tracker.abort();
        }
        self.host.remove_stream_handler(PROTOCOL_ID);
    }
}

/// Send one request and read the reply
async fn exchange(stream: &mut Stream, request: &RelayMessage) -> Result<RelayMessage, CodecError> {
    MessageCodec::send_message(stream, request).await?;
    MessageCodec::recv_message(stream).await
}

/// Keep the known-relay set in step with connection events: probe peers as
/// they connect, forget them as they leave.
fn spawn_tracker(inner: &Arc<RelayInner>) -> JoinHandle<()> {
    let mut events = inner.host.subscribe();
    let existing = inner.host.connected_peers();
    let weak = Arc::downgrade(inner);

    tokio::spawn(async move {
        for peer in existing {
            probe(weak.clone(), peer);
        }

        loop {
            match events.recv().await {
                Ok(HostEvent::Connected(peer)) => probe(weak.clone(), peer),
                Ok(HostEvent::Disconnected(peer)) => {
                    let Some(relay) = weak.upgrade() else { break };
                    if relay.known_relays.write().remove(&peer) {
                        debug!("Forgot relay {}", peer.short_hex());
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Relay tracker missed {} connection events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn probe(relay: Weak<RelayInner>, peer: PeerId) {
    tokio::spawn(async move {
        let Some(relay) = relay.upgrade() else {
            return;
        };
        let deadline = Deadline::after(relay.config.dial_timeout);
        match relay.can_hop(&peer, deadline).await {
            Ok(true) if relay.host.is_connected(&peer) => relay.add_known_relay(peer),
            Ok(_) => {}
            Err(e) => debug!("Relay probe of {} failed: {}", peer.short_hex(), e),
        }
    });
}
