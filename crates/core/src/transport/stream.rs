use quinn::{RecvStream as QuinnRecvStream, SendStream as QuinnSendStream, VarInt};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::host::{StreamRead, StreamWrite};

/// Application error code sent when a stream is aborted
const RESET_CODE: VarInt = VarInt::from_u32(0);

/// A send stream for writing data
pub struct SendStream {
    inner: QuinnSendStream,
}

impl SendStream {
    pub(crate) fn new(inner: QuinnSendStream) -> Self {
        Self { inner }
    }
}

impl AsyncWrite for SendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().inner), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().inner), cx)
    }

    /// Finishes the stream; the remote reads end of stream
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().inner), cx)
    }
}

impl StreamWrite for SendStream {
    fn reset(&mut self) {
        let _ = self.inner.reset(RESET_CODE);
    }
}

/// A receive stream for reading data
pub struct RecvStream {
    inner: QuinnRecvStream,
}

impl RecvStream {
    pub(crate) fn new(inner: QuinnRecvStream) -> Self {
        Self { inner }
    }
}

impl AsyncRead for RecvStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().inner), cx, buf)
    }
}

impl StreamRead for RecvStream {
    fn stop(&mut self) {
        let _ = self.inner.stop(RESET_CODE);
    }
}
