//! Inbound side of the relay protocol.
//!
//! Every stream opened to us on the relay protocol carries one request. HOP
//! requests run through [`HopSession`], a small state machine that ends
//! either splicing the two legs or refusing with a status code. STOP requests
//! go to the listener, CAN_HOP is answered directly.

use circuitnet_common::protocol::{MAX_ADDR_LEN, PROTOCOL_ID};
use circuitnet_common::{PeerId, PeerInfo};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::listener;
use super::relay::RelayInner;
use super::splice::splice;
use crate::host::Stream;
use crate::protocol::{CodecError, MessageCodec, MessageType, PeerDescriptor, RelayMessage, StatusCode};

/// Serve one inbound relay stream
pub(super) async fn handle_stream(relay: Arc<RelayInner>, mut stream: Stream) {
    let remote = stream.remote_peer();
    let read = timeout(
        relay.config.stop_handshake_timeout,
        MessageCodec::recv_message(&mut stream),
    )
    .await;

    let message = match read {
        Ok(Ok(message)) => message,
        Ok(Err(CodecError::Decode(e))) => {
            debug!("Undecodable relay request from {}: {}", remote.short_hex(), e);
            refuse(stream, StatusCode::MalformedMessage).await;
            return;
        }
        Ok(Err(err @ CodecError::FrameTooLarge { .. })) => {
            debug!("Oversized relay request from {}: {}", remote.short_hex(), err);
            refuse(stream, StatusCode::MalformedMessage).await;
            return;
        }
        Ok(Err(e)) => {
            debug!("Failed to read relay request from {}: {}", remote.short_hex(), e);
            stream.reset();
            return;
        }
        Err(_) => {
            debug!("Relay request from {} timed out", remote.short_hex());
            stream.reset();
            return;
        }
    };

    match message.kind {
        MessageType::Hop => HopSession::new(relay, stream).run(message).await,
        MessageType::Stop => listener::handle_stop(&relay, stream, message).await,
        MessageType::CanHop => {
            let code = if relay.config.hop {
                StatusCode::Success
            } else {
                StatusCode::HopCantSpeakRelay
            };
            debug!("Answering CAN_HOP from {} with {}", remote.short_hex(), code);
            reply(stream, code).await;
        }
        MessageType::Status => refuse(stream, StatusCode::MalformedMessage).await,
    }
}

/// A validated HOP request
struct HopRequest {
    src: PeerDescriptor,
    dst: PeerDescriptor,
    src_info: PeerInfo,
    dst_info: PeerInfo,
}

enum HopState {
    Validating(RelayMessage),
    EnsuringConnection(HopRequest),
    OpeningDestination(HopRequest),
    AwaitingPeerStatus { dst_stream: Stream, request: HopRequest },
    Splicing { dst_stream: Stream, request: HopRequest },
    Refused(StatusCode),
}

/// Relay side of one circuit request
struct HopSession {
    relay: Arc<RelayInner>,
    src_stream: Stream,
}

impl HopSession {
    fn new(relay: Arc<RelayInner>, src_stream: Stream) -> Self {
        Self { relay, src_stream }
    }

    async fn run(mut self, message: RelayMessage) {
        let mut state = HopState::Validating(message);
        loop {
            state = match state {
                HopState::Validating(message) => self.validate(message),
                HopState::EnsuringConnection(request) => self.ensure_connection(request).await,
                HopState::OpeningDestination(request) => self.open_destination(request).await,
                HopState::AwaitingPeerStatus {
                    dst_stream,
                    request,
                } => self.await_peer_status(dst_stream, request).await,
                HopState::Splicing {
                    dst_stream,
                    request,
                } => {
                    self.start_splice(dst_stream, request).await;
                    return;
                }
                HopState::Refused(code) => {
                    refuse(self.src_stream, code).await;
                    return;
                }
            };
        }
    }

    fn validate(&self, message: RelayMessage) -> HopState {
        if !self.relay.config.hop {
            return HopState::Refused(StatusCode::HopCantSpeakRelay);
        }

        let src = message.src_peer.unwrap_or_default();
        let dst = message.dst_peer.unwrap_or_default();

        if src.longest_addr() > MAX_ADDR_LEN {
            return HopState::Refused(StatusCode::HopSrcAddrTooLong);
        }
        if dst.longest_addr() > MAX_ADDR_LEN {
            return HopState::Refused(StatusCode::HopDstAddrTooLong);
        }

        let src_info = match src.to_peer_info() {
            Ok(info) if info.id == self.src_stream.remote_peer() => info,
            Ok(info) => {
                debug!(
                    "Source descriptor {} does not match stream peer {}",
                    info.id.short_hex(),
                    self.src_stream.remote_peer().short_hex()
                );
                return HopState::Refused(StatusCode::HopSrcMultiaddrInvalid);
            }
            Err(e) => {
                debug!("Invalid source descriptor: {}", e);
                return HopState::Refused(StatusCode::HopSrcMultiaddrInvalid);
            }
        };
        let dst_info = match dst.to_peer_info() {
            Ok(info) => info,
            Err(e) => {
                debug!("Invalid destination descriptor: {}", e);
                return HopState::Refused(StatusCode::HopDstMultiaddrInvalid);
            }
        };

        if dst_info.id == self.relay.local_peer() || dst_info.id == src_info.id {
            return HopState::Refused(StatusCode::HopCantRelayToSelf);
        }

        HopState::EnsuringConnection(HopRequest {
            src,
            dst,
            src_info,
            dst_info,
        })
    }

    async fn ensure_connection(&mut self, request: HopRequest) -> HopState {
        let host = &self.relay.host;
        if host.is_connected(&request.dst_info.id) {
            return HopState::OpeningDestination(request);
        }
        if !self.relay.config.active {
            return HopState::Refused(StatusCode::HopNoConnToDst);
        }

        debug!("Dialing {} on behalf of {}", request.dst_info.id.short_hex(), request.src_info.id.short_hex());
        match timeout(self.relay.config.hop_connect_timeout, host.connect(&request.dst_info)).await {
            Ok(Ok(())) => HopState::OpeningDestination(request),
            Ok(Err(e)) => {
                debug!("Failed to dial {}: {}", request.dst_info.id.short_hex(), e);
                HopState::Refused(StatusCode::HopCantDialDst)
            }
            Err(_) => {
                debug!("Dialing {} timed out", request.dst_info.id.short_hex());
                HopState::Refused(StatusCode::HopCantDialDst)
            }
        }
    }

    async fn open_destination(&mut self, request: HopRequest) -> HopState {
        let deadline = Instant::now() + self.relay.config.hop_connect_timeout;
        let dst = request.dst_info.id;

        let mut dst_stream =
            match timeout_at(deadline, self.relay.host.open_stream(&dst, PROTOCOL_ID)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("Failed to open stream to {}: {}", dst.short_hex(), e);
                    return HopState::Refused(StatusCode::HopCantOpenDstStream);
                }
                Err(_) => return HopState::Refused(StatusCode::HopCantOpenDstStream),
            };

        let stop = RelayMessage::stop(request.src.clone(), request.dst.clone());
        match timeout_at(deadline, MessageCodec::send_message(&mut dst_stream, &stop)).await {
            Ok(Ok(())) => HopState::AwaitingPeerStatus {
                dst_stream,
                request,
            },
            _ => {
                dst_stream.reset();
                HopState::Refused(StatusCode::HopCantOpenDstStream)
            }
        }
    }

    async fn await_peer_status(&mut self, mut dst_stream: Stream, request: HopRequest) -> HopState {
        let reply = timeout(
            self.relay.config.stop_handshake_timeout,
            MessageCodec::recv_message(&mut dst_stream),
        )
        .await;

        match reply {
            Ok(Ok(message)) => match message.status_code() {
                Some(StatusCode::Success) => HopState::Splicing {
                    dst_stream,
                    request,
                },
                Some(code) => {
                    dst_stream.reset();
                    HopState::Refused(code)
                }
                None => {
                    debug!("Destination answered STOP with {}", message.kind);
                    dst_stream.reset();
                    HopState::Refused(StatusCode::HopCantOpenDstStream)
                }
            },
            Ok(Err(e)) => {
                debug!("Failed to read STOP reply from {}: {}", request.dst_info.id.short_hex(), e);
                dst_stream.reset();
                HopState::Refused(StatusCode::HopCantOpenDstStream)
            }
            Err(_) => {
                debug!("STOP reply from {} timed out", request.dst_info.id.short_hex());
                dst_stream.reset();
                HopState::Refused(StatusCode::HopCantOpenDstStream)
            }
        }
    }

    async fn start_splice(mut self, mut dst_stream: Stream, request: HopRequest) {
        if let Err(e) =
            MessageCodec::send_message(&mut self.src_stream, &RelayMessage::status(StatusCode::Success)).await
        {
            debug!("Source went away before the circuit opened: {}", e);
            self.src_stream.reset();
            dst_stream.reset();
            return;
        }

        let src: PeerId = request.src_info.id;
        let dst: PeerId = request.dst_info.id;
        info!(source = %src.short_hex(), destination = %dst.short_hex(), "Relaying circuit");

        let src_stream = self.src_stream;
        tokio::spawn(async move {
            let report = splice(src_stream, dst_stream).await;
            debug!(
                source = %src.short_hex(),
                destination = %dst.short_hex(),
                "Circuit closed: {} bytes forward, {} bytes back{}",
                report.a_to_b,
                report.b_to_a,
                if report.faulted { ", reset" } else { "" }
            );
        });
    }
}

/// Write a status reply and close our side
pub(super) async fn reply(mut stream: Stream, code: StatusCode) {
    let sent = MessageCodec::send_message(&mut stream, &RelayMessage::status(code)).await;
    match sent {
        Ok(()) => {
            let _ = stream.shutdown().await;
        }
        Err(e) => {
            debug!("Failed to send {} to {}: {}", code, stream.remote_peer().short_hex(), e);
            stream.reset();
        }
    }
}

/// Refuse a request with `code`
pub(super) async fn refuse(stream: Stream, code: StatusCode) {
    warn!(peer = %stream.remote_peer().short_hex(), code = %code, "Refusing relay request");
    reply(stream, code).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn require_send<T: Send>(_: T) {}

    #[test]
    fn test_inbound_handling_can_be_spawned() {
        // Checked at compile time; the closure is never called
        let _ = |relay: Arc<RelayInner>, stream: Stream| require_send(handle_stream(relay, stream));
        let _ = |session: HopSession, message: RelayMessage| require_send(session.run(message));
    }
}
