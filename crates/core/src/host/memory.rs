//! In-process host network.
//!
//! Hosts created from the same [`MemoryNetwork`] can connect to each other by
//! their `/memory/<n>` address and exchange streams without touching sockets.
//! Streams keep the same half-close and reset semantics as QUIC streams:
//! dropping or shutting down a writer ends the remote reader cleanly, while a
//! reset (or tearing down the link) makes the remote reader fail.

use async_trait::async_trait;
use circuitnet_common::{NetworkAddress, PeerId, PeerInfo};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{
    Host, HostError, HostEvent, Stream, StreamHandler, StreamRead, StreamWrite,
    EVENT_CHANNEL_CAPACITY,
};
use crate::identity::KeyPair;

/// A set of in-process hosts that can reach one another
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    next_address: AtomicU64,
    state: Mutex<NetworkState>,
}

#[derive(Default)]
struct NetworkState {
    hosts: HashMap<PeerId, Weak<MemoryHost>>,
    addresses: HashMap<u64, PeerId>,
    links: HashMap<LinkKey, Link>,
}

/// Unordered pair of peers sharing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LinkKey(PeerId, PeerId);

impl LinkKey {
    fn new(a: PeerId, b: PeerId) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }
}

/// Streams opened over one connection, so tearing it down can reset them
#[derive(Default)]
struct Link {
    streams: Vec<mpsc::WeakUnboundedSender<Frame>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a host with a fresh identity and a unique memory address
    pub fn add_host(&self) -> Arc<MemoryHost> {
        let peer_id = KeyPair::generate().peer_id();
        let address = self.inner.next_address.fetch_add(1, Ordering::Relaxed) + 1;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let host = Arc::new(MemoryHost {
            peer_id,
            address: NetworkAddress::Memory(address),
            network: self.inner.clone(),
            handlers: RwLock::new(HashMap::new()),
            events,
        });

        let mut state = self.inner.state.lock();
        state.hosts.insert(peer_id, Arc::downgrade(&host));
        state.addresses.insert(address, peer_id);

        debug!("Memory host {} listening on /memory/{}", peer_id.short_hex(), address);
        host
    }

    /// Connect two hosts directly, as if one had dialed the other
    pub fn link(&self, a: &PeerId, b: &PeerId) -> Result<(), HostError> {
        self.inner.link(*a, *b)
    }

    /// Tear down the connection between two hosts, resetting its streams.
    /// Returns false when they were not connected.
    pub fn unlink(&self, a: &PeerId, b: &PeerId) -> bool {
        self.inner.unlink(*a, *b)
    }
}

impl NetworkInner {
    fn host(&self, peer: &PeerId) -> Option<Arc<MemoryHost>> {
        self.state.lock().hosts.get(peer).and_then(Weak::upgrade)
    }

    fn link(&self, a: PeerId, b: PeerId) -> Result<(), HostError> {
        if a == b {
            return Err(HostError::DialFailed {
                peer: b,
                reason: "cannot connect to self".to_string(),
            });
        }

        let (host_a, host_b) = {
            let mut state = self.state.lock();
            let host_a = state
                .hosts
                .get(&a)
                .and_then(Weak::upgrade)
                .ok_or(HostError::Closed)?;
            let host_b = state
                .hosts
                .get(&b)
                .and_then(Weak::upgrade)
                .ok_or_else(|| HostError::DialFailed {
                    peer: b,
                    reason: "host is gone".to_string(),
                })?;

            let key = LinkKey::new(a, b);
            if state.links.contains_key(&key) {
                return Ok(());
            }
            state.links.insert(key, Link::default());
            (host_a, host_b)
        };

        let _ = host_a.events.send(HostEvent::Connected(b));
        let _ = host_b.events.send(HostEvent::Connected(a));
        Ok(())
    }

    fn unlink(&self, a: PeerId, b: PeerId) -> bool {
        let (link, host_a, host_b) = {
            let mut state = self.state.lock();
            let Some(link) = state.links.remove(&LinkKey::new(a, b)) else {
                return false;
            };
            let host_a = state.hosts.get(&a).and_then(Weak::upgrade);
            let host_b = state.hosts.get(&b).and_then(Weak::upgrade);
            (link, host_a, host_b)
        };

        for sender in link.streams.iter().filter_map(|weak| weak.upgrade()) {
            let _ = sender.send(Frame::Reset);
        }

        if let Some(host) = host_a {
            let _ = host.events.send(HostEvent::Disconnected(b));
        }
        if let Some(host) = host_b {
            let _ = host.events.send(HostEvent::Disconnected(a));
        }
        true
    }

    fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        self.state.lock().links.contains_key(&LinkKey::new(a, b))
    }
}

/// A host living on a [`MemoryNetwork`]
pub struct MemoryHost {
    peer_id: PeerId,
    address: NetworkAddress,
    network: Arc<NetworkInner>,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    events: broadcast::Sender<HostEvent>,
}

impl MemoryHost {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn address(&self) -> &NetworkAddress {
        &self.address
    }

    /// Identity plus dialable address
    pub fn info(&self) -> PeerInfo {
        PeerInfo::with_addresses(self.peer_id, vec![self.address.clone()])
    }

    /// Close the connection to `peer`, resetting all streams over it
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        self.network.unlink(self.peer_id, *peer)
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn local_peer(&self) -> PeerId {
        self.peer_id
    }

    fn listen_addresses(&self) -> Vec<NetworkAddress> {
        vec![self.address.clone()]
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.network.is_linked(self.peer_id, *peer)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let state = self.network.state.lock();
        state
            .links
            .keys()
            .filter_map(|LinkKey(a, b)| {
                if *a == self.peer_id {
                    Some(*b)
                } else if *b == self.peer_id {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), HostError> {
        if self.is_connected(&peer.id) {
            return Ok(());
        }
        if peer.addresses.is_empty() {
            return Err(HostError::NoAddresses(peer.id));
        }

        let reachable = {
            let state = self.network.state.lock();
            peer.addresses.iter().any(|address| match address {
                NetworkAddress::Memory(n) => state.addresses.get(n) == Some(&peer.id),
                _ => false,
            })
        };
        if !reachable {
            return Err(HostError::DialFailed {
                peer: peer.id,
                reason: "no reachable memory address".to_string(),
            });
        }

        self.network.link(self.peer_id, peer.id)
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<Stream, HostError> {
        if !self.is_connected(peer) {
            return Err(HostError::NotConnected(*peer));
        }
        let remote = self
            .network
            .host(peer)
            .ok_or(HostError::NotConnected(*peer))?;

        let handler = remote
            .handlers
            .read()
            .get(protocol)
            .cloned()
            .ok_or_else(|| HostError::ProtocolNotSupported {
                peer: *peer,
                protocol: protocol.to_string(),
            })?;

        let (local, inbound, senders) = pipe(self.peer_id, *peer, protocol);
        {
            let mut state = self.network.state.lock();
            let link = state
                .links
                .get_mut(&LinkKey::new(self.peer_id, *peer))
                .ok_or(HostError::NotConnected(*peer))?;
            link.streams
                .retain(|weak| weak.upgrade().is_some_and(|sender| !sender.is_closed()));
            link.streams.extend(senders);
        }

        handler(inbound);
        Ok(local)
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

impl Drop for MemoryHost {
    fn drop(&mut self) {
        let peers: Vec<PeerId> = {
            let mut state = self.network.state.lock();
            state.hosts.remove(&self.peer_id);
            if let NetworkAddress::Memory(n) = self.address {
                state.addresses.remove(&n);
            }
            state
                .links
                .keys()
                .filter_map(|LinkKey(a, b)| {
                    if *a == self.peer_id {
                        Some(*b)
                    } else if *b == self.peer_id {
                        Some(*a)
                    } else {
                        None
                    }
                })
                .collect()
        };
        for peer in peers {
            self.network.unlink(self.peer_id, peer);
        }
    }
}

enum Frame {
    Data(Vec<u8>),
    Fin,
    Reset,
}

/// Build both ends of a stream; also returns weak handles to its two
/// directions for the link registry
fn pipe(
    local: PeerId,
    remote: PeerId,
    protocol: &str,
) -> (Stream, Stream, [mpsc::WeakUnboundedSender<Frame>; 2]) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let weak = [outbound_tx.downgrade(), inbound_tx.downgrade()];

    let local_end = Stream::new(
        MemoryReader::new(inbound_rx),
        MemoryWriter::new(outbound_tx),
        remote,
        protocol,
    );
    let remote_end = Stream::new(
        MemoryReader::new(outbound_rx),
        MemoryWriter::new(inbound_tx),
        local,
        protocol,
    );
    (local_end, remote_end, weak)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Open,
    Finished,
    Reset,
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Frame>,
    buffer: Vec<u8>,
    offset: usize,
    state: ReadState,
}

impl MemoryReader {
    fn new(rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            rx,
            buffer: Vec::new(),
            offset: 0,
            state: ReadState::Open,
        }
    }

    fn mark_reset(&mut self) {
        self.state = ReadState::Reset;
        self.rx.close();
    }
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.offset < this.buffer.len() {
                let n = (this.buffer.len() - this.offset).min(buf.remaining());
                buf.put_slice(&this.buffer[this.offset..this.offset + n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }

            match this.state {
                ReadState::Finished => return Poll::Ready(Ok(())),
                ReadState::Reset => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "stream reset",
                    )))
                }
                ReadState::Open => {}
            }

            match ready!(this.rx.poll_recv(cx)) {
                Some(Frame::Data(data)) => {
                    this.buffer = data;
                    this.offset = 0;
                }
                Some(Frame::Fin) => this.state = ReadState::Finished,
                // A writer that vanished without finishing counts as a reset
                Some(Frame::Reset) | None => this.mark_reset(),
            }
        }
    }
}

impl StreamRead for MemoryReader {
    fn stop(&mut self) {
        self.buffer.clear();
        self.offset = 0;
        self.mark_reset();
    }
}

struct MemoryWriter {
    tx: mpsc::UnboundedSender<Frame>,
    finished: bool,
}

impl MemoryWriter {
    fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            tx,
            finished: false,
        }
    }
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.finished {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed for writing",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        self.tx
            .send(Frame::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream reset by peer"))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.finished {
            self.finished = true;
            let _ = self.tx.send(Frame::Fin);
        }
        Poll::Ready(Ok(()))
    }
}

impl StreamWrite for MemoryWriter {
    fn reset(&mut self) {
        if !self.finished {
            self.finished = true;
            let _ = self.tx.send(Frame::Reset);
        }
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.tx.send(Frame::Fin);
        }
    }
}
