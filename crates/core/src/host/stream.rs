use circuitnet_common::PeerId;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Read half of a host stream
pub trait StreamRead: AsyncRead + Send + Unpin {
    /// Abort the read side; further writes by the remote fail
    fn stop(&mut self);
}

/// Write half of a host stream
pub trait StreamWrite: AsyncWrite + Send + Unpin {
    /// Abort the write side; the remote's reads fail with a reset instead of
    /// ending cleanly
    fn reset(&mut self);
}

pub type BoxedReader = Box<dyn StreamRead>;
pub type BoxedWriter = Box<dyn StreamWrite>;

/// A bidirectional stream to a remote peer, negotiated for one protocol.
///
/// `shutdown` half-closes the write side; dropping the stream closes it
/// gracefully; `reset` aborts both directions.
pub struct Stream {
    reader: BoxedReader,
    writer: BoxedWriter,
    remote_peer: PeerId,
    protocol: String,
}

impl Stream {
    pub fn new(
        reader: impl StreamRead + 'static,
        writer: impl StreamWrite + 'static,
        remote_peer: PeerId,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote_peer,
            protocol: protocol.into(),
        }
    }

    /// Peer at the other end of this stream
    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Abort both directions
    pub fn reset(&mut self) {
        self.writer.reset();
        self.reader.stop();
    }

    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("remote_peer", &self.remote_peer)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}
