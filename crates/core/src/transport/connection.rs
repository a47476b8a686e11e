use quinn::Connection as QuinnConnection;
use std::net::SocketAddr;

use super::{RecvStream, SendStream};

/// A QUIC connection to a remote peer
#[derive(Debug, Clone)]
pub struct Connection {
    /// Quinn connection
    inner: QuinnConnection,
}

impl Connection {
    /// Create a new connection wrapper
    pub(crate) fn new(inner: QuinnConnection) -> Self {
        Self { inner }
    }

    /// Open a bidirectional stream.
    ///
    /// The remote only learns about the stream once something is written.
    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream), ConnectionError> {
        let (send, recv) = self.inner
            .open_bi()
            .await
            .map_err(|e| ConnectionError::StreamOpen(e.to_string()))?;

        Ok((SendStream::new(send), RecvStream::new(recv)))
    }

    /// Accept an incoming bidirectional stream
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ConnectionError> {
        let (send, recv) = self.inner
            .accept_bi()
            .await
            .map_err(|e| ConnectionError::Closed(e.to_string()))?;

        Ok((SendStream::new(send), RecvStream::new(recv)))
    }

    /// Get remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    /// Identifier distinguishing this connection from later ones to the same peer
    pub fn stable_id(&self) -> usize {
        self.inner.stable_id()
    }

    /// Close the connection gracefully
    pub fn close(&self, error_code: u32, reason: &str) {
        self.inner.close(error_code.into(), reason.as_bytes());
    }

    /// Check if connection is closed
    pub fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to open stream: {0}")]
    StreamOpen(String),

    #[error("Connection closed: {0}")]
    Closed(String),
}
