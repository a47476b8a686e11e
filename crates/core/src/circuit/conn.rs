use circuitnet_common::{PeerId, PeerInfo};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::address::CircuitAddress;
use crate::host::Stream;

/// A byte stream tunneled through a relay.
///
/// The remote peer is the far end of the circuit (the destination when
/// dialing, the source when accepting), never the relay itself.
#[derive(Debug)]
pub struct RelayedConn {
    stream: Stream,
    remote: PeerInfo,
    relay: PeerId,
}

impl RelayedConn {
    pub(crate) fn new(stream: Stream, remote: PeerInfo, relay: PeerId) -> Self {
        Self {
            stream,
            remote,
            relay,
        }
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote.id
    }

    /// Remote identity with the addresses it announced
    pub fn remote_info(&self) -> &PeerInfo {
        &self.remote
    }

    pub fn relay_peer(&self) -> PeerId {
        self.relay
    }

    /// Circuit address of the remote end, through the relay carrying it
    pub fn remote_address(&self) -> CircuitAddress {
        CircuitAddress::via(&PeerInfo::new(self.relay), self.remote.id)
    }

    /// Abort the circuit in both directions
    pub fn reset(&mut self) {
        self.stream.reset();
    }

    pub fn into_stream(self) -> Stream {
        self.stream
    }
}

impl AsyncRead for RelayedConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for RelayedConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
