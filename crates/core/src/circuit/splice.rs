//! Bidirectional forwarding between the two legs of a circuit.
//!
//! Each direction runs its own copy loop. End of stream on one side
//! half-closes the other side's write half and leaves the opposite direction
//! running. A read or write error aborts the whole circuit: the failing loop
//! resets its halves and raises a shared fault flag, and the other loop resets
//! its own halves as soon as it sees the flag. A fault on either leg therefore
//! shows up as a reset at the far end of the other leg.

use circuitnet_common::relay::SPLICE_BUFFER_SIZE;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

use crate::host::{BoxedReader, BoxedWriter, Stream};

/// Bytes moved per direction once a splice has finished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceReport {
    pub a_to_b: u64,
    pub b_to_a: u64,
    /// Whether the circuit ended in a reset rather than two clean closes
    pub faulted: bool,
}

/// Forward bytes between `a` and `b` until both directions have ended
pub async fn splice(a: Stream, b: Stream) -> SpliceReport {
    let (a_read, a_write) = a.into_split();
    let (b_read, b_write) = b.into_split();
    let (fault, _) = watch::channel(false);
    let fault = Arc::new(fault);

    let (forward, backward) = tokio::join!(
        pump(a_read, b_write, fault.clone()),
        pump(b_read, a_write, fault.clone()),
    );

    SpliceReport {
        a_to_b: forward.copied,
        b_to_a: backward.copied,
        faulted: forward.faulted || backward.faulted,
    }
}

struct PumpOutcome {
    copied: u64,
    faulted: bool,
}

enum Step {
    Copied(io::Result<usize>),
    Aborted,
}

async fn pump(
    mut reader: BoxedReader,
    mut writer: BoxedWriter,
    fault: Arc<watch::Sender<bool>>,
) -> PumpOutcome {
    let mut fault_rx = fault.subscribe();
    let mut buf = vec![0u8; SPLICE_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let step = tokio::select! {
            result = copy_chunk(&mut reader, &mut writer, &mut buf) => Step::Copied(result),
            _ = fault_rx.wait_for(|faulted| *faulted) => Step::Aborted,
        };

        match step {
            Step::Copied(Ok(0)) => {
                let _ = writer.shutdown().await;
                return PumpOutcome {
                    copied,
                    faulted: false,
                };
            }
            Step::Copied(Ok(n)) => copied += n as u64,
            Step::Copied(Err(e)) => {
                debug!("Splice direction failed after {} bytes: {}", copied, e);
                reader.stop();
                writer.reset();
                fault.send_replace(true);
                return PumpOutcome {
                    copied,
                    faulted: true,
                };
            }
            Step::Aborted => {
                reader.stop();
                writer.reset();
                return PumpOutcome {
                    copied,
                    faulted: true,
                };
            }
        }
    }
}

async fn copy_chunk(
    reader: &mut BoxedReader,
    writer: &mut BoxedWriter,
    buf: &mut [u8],
) -> io::Result<usize> {
    let n = reader.read(buf).await?;
    if n > 0 {
        writer.write_all(&buf[..n]).await?;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Host, MemoryHost, MemoryNetwork};
    use tokio::sync::mpsc;

    const PIPE: &str = "/test/pipe";

    /// Two connected stream ends over a fresh memory link. The hosts are
    /// returned so the link outlives the call.
    async fn stream_pair(network: &MemoryNetwork) -> (Stream, Stream, [Arc<MemoryHost>; 2]) {
        let a = network.add_host();
        let b = network.add_host();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_stream_handler(
            PIPE,
            Arc::new(move |stream| {
                let _ = tx.send(stream);
            }),
        );
        network.link(&a.peer_id(), &b.peer_id()).unwrap();

        let local = a.open_stream(&b.peer_id(), PIPE).await.unwrap();
        let remote = rx.recv().await.unwrap();
        (local, remote, [a, b])
    }

    #[tokio::test]
    async fn test_splice_forwards_both_directions() {
        let network = MemoryNetwork::new();
        let (mut source, relay_in, _first) = stream_pair(&network).await;
        let (relay_out, mut destination, _second) = stream_pair(&network).await;

        let splicing = tokio::spawn(splice(relay_in, relay_out));

        source.write_all(b"ping").await.unwrap();
        source.shutdown().await.unwrap();

        let mut received = Vec::new();
        destination.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        // The other direction is still open after the half close
        destination.write_all(b"pong!").await.unwrap();
        destination.shutdown().await.unwrap();

        let mut reply = Vec::new();
        source.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong!");

        let report = splicing.await.unwrap();
        assert_eq!(
            report,
            SpliceReport {
                a_to_b: 4,
                b_to_a: 5,
                faulted: false
            }
        );
    }

    #[tokio::test]
    async fn test_reset_propagates_to_far_end() {
        let network = MemoryNetwork::new();
        let (mut source, relay_in, _first) = stream_pair(&network).await;
        let (relay_out, mut destination, _second) = stream_pair(&network).await;

        let splicing = tokio::spawn(splice(relay_in, relay_out));

        source.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        destination.read_exact(&mut buf).await.unwrap();

        source.reset();

        let err = destination.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        let report = splicing.await.unwrap();
        assert!(report.faulted);
        assert_eq!(report.a_to_b, 3);
    }

    #[tokio::test]
    async fn test_link_teardown_resets_other_leg() {
        let network = MemoryNetwork::new();
        let (mut source, relay_in, _first) = stream_pair(&network).await;
        let (relay_out, _destination, [relay, destination]) = stream_pair(&network).await;

        let splicing = tokio::spawn(splice(relay_in, relay_out));

        assert!(destination.disconnect(&relay.peer_id()));

        let mut buf = [0u8; 8];
        let err = source.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(splicing.await.unwrap().faulted);
    }
}
