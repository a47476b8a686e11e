//! End-to-end circuit tests over in-memory hosts

use circuitnet_common::protocol::{MAX_ADDR_LEN, PROTOCOL_ID};
use circuitnet_common::{PeerId, PeerInfo, RelayConfig};
use circuitnet_core::{
    CircuitAddress, CircuitError, Host, HostError, KeyPair, MemoryHost, MemoryNetwork, Relay,
    StatusCode, Stream,
};
use circuitnet_core::protocol::{MessageCodec, MessageType, PeerDescriptor, RelayMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const MSG: &[u8] = b"relay works!";

struct Node {
    host: Arc<MemoryHost>,
    relay: Relay,
}

impl Node {
    fn id(&self) -> PeerId {
        self.host.peer_id()
    }

    fn info(&self) -> PeerInfo {
        self.host.info()
    }
}

fn config() -> RelayConfig {
    RelayConfig::new()
        .with_dial_timeout(Duration::from_secs(2))
        .with_hop_connect_timeout(Duration::from_secs(1))
        .with_stop_handshake_timeout(Duration::from_secs(2))
        .with_accept_timeout(Duration::from_millis(500))
}

fn hop_config() -> RelayConfig {
    config().with_hop(true)
}

fn node(network: &MemoryNetwork, config: RelayConfig) -> Node {
    let host = network.add_host();
    let relay = Relay::new(host.clone(), config);
    Node { host, relay }
}

fn connect(network: &MemoryNetwork, a: &Node, b: &Node) {
    network.link(&a.id(), &b.id()).unwrap();
}

/// Accept one circuit on `node`, write `msg` and close it.
/// Resolves to the accepted connection's remote and relay peers.
fn serve_once(node: &Node, msg: &'static [u8]) -> JoinHandle<(PeerId, PeerId)> {
    let mut listener = node.relay.listener();
    tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        conn.write_all(msg).await.unwrap();
        conn.shutdown().await.unwrap();
        (conn.remote_peer(), conn.relay_peer())
    })
}

/// Three nodes A - R - B with R relaying
fn relay_triangle(network: &MemoryNetwork, relay_config: RelayConfig) -> (Node, Node, Node) {
    let a = node(network, config());
    let r = node(network, relay_config);
    let b = node(network, config());
    connect(network, &a, &r);
    connect(network, &r, &b);
    (a, r, b)
}

#[tokio::test]
async fn test_basic_relay() {
    let network = MemoryNetwork::new();
    let (a, r, b) = relay_triangle(&network, hop_config());

    let served = serve_once(&b, MSG);

    let mut conn = a.relay.dial_peer(&r.info(), &b.info()).await.unwrap();
    assert_eq!(conn.remote_peer(), b.id());
    assert_eq!(conn.relay_peer(), r.id());

    let mut data = Vec::new();
    conn.read_to_end(&mut data).await.unwrap();
    assert_eq!(data, MSG);

    let (remote, relay) = served.await.unwrap();
    assert_eq!(remote, a.id());
    assert_eq!(relay, r.id());
}

#[tokio::test]
async fn test_relay_reset() {
    let network = MemoryNetwork::new();
    let (a, r, b) = relay_triangle(&network, hop_config());

    let mut listener = b.relay.listener();
    let (ready_tx, ready_rx) = oneshot::channel::<()>();
    let destination = b.host.clone();
    let relay_id = r.id();
    tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        ready_rx.await.unwrap();
        conn.write_all(MSG).await.unwrap();
        destination.disconnect(&relay_id);
    });

    let mut conn = a.relay.dial_peer(&r.info(), &b.info()).await.unwrap();
    ready_tx.send(()).unwrap();

    let mut data = Vec::new();
    assert!(conn.read_to_end(&mut data).await.is_err());
}

#[tokio::test]
async fn test_basic_relay_dial() {
    let network = MemoryNetwork::new();
    let (a, r, b) = relay_triangle(&network, hop_config());

    let served = serve_once(&b, MSG);

    let addr = format!("/ipfs/{}/p2p-circuit/ipfs/{}", r.id(), b.id());
    let dialer = a.relay.dialer();
    assert!(dialer.can_dial(&addr));

    let mut conn = dialer.dial_str(&addr).await.unwrap();
    let mut data = Vec::new();
    conn.read_to_end(&mut data).await.unwrap();
    assert_eq!(data, MSG);
    assert_eq!(conn.remote_address(), CircuitAddress::via(&PeerInfo::new(r.id()), b.id()));

    served.await.unwrap();
}

#[tokio::test]
async fn test_unspecific_relay_dial() {
    let network = MemoryNetwork::new();
    let (a, _r, b) = relay_triangle(&network, hop_config());

    let served = serve_once(&b, MSG);

    let addr: CircuitAddress = format!("/p2p-circuit/p2p/{}", b.id()).parse().unwrap();
    let mut conn = a.relay.dialer().dial(&addr).await.unwrap();

    let mut data = Vec::new();
    conn.read_to_end(&mut data).await.unwrap();
    assert_eq!(data, MSG);

    served.await.unwrap();
}

#[tokio::test]
async fn test_relay_through_non_hop() {
    let network = MemoryNetwork::new();
    let (a, r, b) = relay_triangle(&network, config());

    let err = a.relay.dial_peer(&r.info(), &b.info()).await.unwrap_err();
    assert!(matches!(err, CircuitError::Relay(_)));
    assert_eq!(err.relay_code(), Some(StatusCode::HopCantSpeakRelay));
}

#[tokio::test]
async fn test_relay_no_dest_connection() {
    let network = MemoryNetwork::new();
    let a = node(&network, config());
    let r = node(&network, hop_config());
    let b = node(&network, config());
    connect(&network, &a, &r);

    let err = a.relay.dial_peer(&r.info(), &b.info()).await.unwrap_err();
    assert_eq!(err.relay_code(), Some(StatusCode::HopNoConnToDst));
}

#[tokio::test]
async fn test_active_relay() {
    let network = MemoryNetwork::new();
    let a = node(&network, config());
    let r = node(&network, hop_config().with_active(true));
    let b = node(&network, config());
    connect(&network, &a, &r);

    let served = serve_once(&b, MSG);

    let mut conn = a.relay.dial_peer(&r.info(), &b.info()).await.unwrap();
    let mut data = Vec::new();
    conn.read_to_end(&mut data).await.unwrap();
    assert_eq!(data, MSG);
    assert!(r.host.is_connected(&b.id()));

    served.await.unwrap();
}

#[tokio::test]
async fn test_relay_can_hop() {
    let network = MemoryNetwork::new();
    let a = node(&network, config());
    let hop = node(&network, hop_config());
    let plain = node(&network, config());
    let bare = network.add_host();
    connect(&network, &a, &hop);
    connect(&network, &a, &plain);
    network.link(&a.id(), &bare.peer_id()).unwrap();

    assert!(a.relay.can_hop(&hop.id()).await.unwrap());
    assert!(!a.relay.can_hop(&plain.id()).await.unwrap());

    let err = a.relay.can_hop(&bare.peer_id()).await.unwrap_err();
    assert!(matches!(
        err,
        CircuitError::Host(HostError::ProtocolNotSupported { .. })
    ));
}

#[tokio::test]
async fn test_destination_without_listener_refuses() {
    let network = MemoryNetwork::new();
    let (a, r, b) = relay_triangle(&network, hop_config());

    let err = a.relay.dial_peer(&r.info(), &b.info()).await.unwrap_err();
    assert_eq!(err.relay_code(), Some(StatusCode::StopRelayRefused));
}

#[tokio::test]
async fn test_relay_to_self_refused() {
    let network = MemoryNetwork::new();
    let (a, r, _b) = relay_triangle(&network, hop_config());

    let err = a.relay.dial_peer(&r.info(), &r.info()).await.unwrap_err();
    assert_eq!(err.relay_code(), Some(StatusCode::HopCantRelayToSelf));

    let err = a.relay.dial_peer(&r.info(), &a.info()).await.unwrap_err();
    assert_eq!(err.relay_code(), Some(StatusCode::HopCantRelayToSelf));
}

#[tokio::test]
async fn test_destination_without_relay_protocol() {
    let network = MemoryNetwork::new();
    let a = node(&network, config());
    let r = node(&network, hop_config());
    let bare = network.add_host();
    connect(&network, &a, &r);
    network.link(&r.id(), &bare.peer_id()).unwrap();

    let err = a
        .relay
        .dial_peer(&r.info(), &bare.info())
        .await
        .unwrap_err();
    assert_eq!(err.relay_code(), Some(StatusCode::HopCantOpenDstStream));
}

#[tokio::test]
async fn test_active_relay_cannot_dial() {
    let network = MemoryNetwork::new();
    let a = node(&network, config());
    let r = node(&network, hop_config().with_active(true));
    connect(&network, &a, &r);

    let unknown = PeerInfo::new(KeyPair::generate().peer_id());
    let err = a.relay.dial_peer(&r.info(), &unknown).await.unwrap_err();
    assert_eq!(err.relay_code(), Some(StatusCode::HopCantDialDst));
}

#[tokio::test]
async fn test_dial_times_out_and_resets() {
    let network = MemoryNetwork::new();
    let a = node(&network, config().with_discover_relays(false));
    let silent = network.add_host();
    let (tx, mut rx) = mpsc::unbounded_channel();
    silent.set_stream_handler(
        PROTOCOL_ID,
        Arc::new(move |stream: Stream| {
            let _ = tx.send(stream);
        }),
    );
    network.link(&a.id(), &silent.peer_id()).unwrap();

    let destination = PeerInfo::new(KeyPair::generate().peer_id());
    let err = a
        .relay
        .dial_peer_timeout(&silent.info(), &destination, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.relay_code(), None);

    // The abandoned request stream is reset, not left open
    let mut held = rx.recv().await.unwrap();
    let mut request = Vec::new();
    assert!(held.read_to_end(&mut request).await.is_err());
}

#[tokio::test]
async fn test_bidirectional_transfer() {
    let network = MemoryNetwork::new();
    let (a, r, b) = relay_triangle(&network, hop_config());

    let mut listener = b.relay.listener();
    let echo = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        let mut data = Vec::new();
        conn.read_to_end(&mut data).await.unwrap();
        conn.write_all(&data).await.unwrap();
        conn.shutdown().await.unwrap();
        conn.remote_peer()
    });

    let mut conn = a.relay.dial_peer(&r.info(), &b.info()).await.unwrap();
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    conn.write_all(&payload).await.unwrap();
    conn.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    conn.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);
    assert_eq!(echo.await.unwrap(), a.id());
}

#[tokio::test]
async fn test_dial_connects_to_relay_from_address() {
    let network = MemoryNetwork::new();
    let a = node(&network, config());
    let r = node(&network, hop_config());
    let b = node(&network, config());
    connect(&network, &r, &b);

    let served = serve_once(&b, MSG);

    let addr = CircuitAddress::via(&r.info(), b.id());
    assert!(addr.to_string().starts_with("/memory/"));
    let mut conn = a.relay.dialer().dial(&addr).await.unwrap();

    let mut data = Vec::new();
    conn.read_to_end(&mut data).await.unwrap();
    assert_eq!(data, MSG);
    assert!(a.host.is_connected(&r.id()));

    served.await.unwrap();
}

#[tokio::test]
async fn test_unspecific_dial_without_relays() {
    let network = MemoryNetwork::new();
    let (a, _r, b) = relay_triangle(&network, config());

    let err = a
        .relay
        .dialer()
        .dial(&CircuitAddress::unspecified(b.id()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CircuitError::NoUsableRelay { destination, tried: 0 } if destination == b.id()
    ));
}

#[tokio::test]
async fn test_discovers_hop_capable_peers() {
    let network = MemoryNetwork::new();
    let a = node(&network, config());
    let r = node(&network, hop_config());
    let plain = node(&network, config());
    connect(&network, &a, &r);
    connect(&network, &a, &plain);

    let discovered = tokio::time::timeout(Duration::from_secs(2), async {
        while a.relay.known_relays() != vec![r.id()] {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(discovered.is_ok());

    network.unlink(&a.id(), &r.id());
    let forgotten = tokio::time::timeout(Duration::from_secs(2), async {
        while !a.relay.known_relays().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(forgotten.is_ok());
}

#[tokio::test]
async fn test_closed_listener_refuses() {
    let network = MemoryNetwork::new();
    let (a, r, b) = relay_triangle(&network, hop_config());

    let mut listener = b.relay.listener();
    assert_eq!(listener.local_address(), CircuitAddress::unspecified(b.id()));
    listener.close();
    assert!(matches!(
        listener.accept().await,
        Err(CircuitError::ListenerClosed)
    ));

    let err = a.relay.dial_peer(&r.info(), &b.info()).await.unwrap_err();
    assert_eq!(err.relay_code(), Some(StatusCode::StopRelayRefused));
}

#[tokio::test]
async fn test_new_listener_replaces_old() {
    let network = MemoryNetwork::new();
    let (a, r, b) = relay_triangle(&network, hop_config());

    let mut old = b.relay.listener();
    let served = serve_once(&b, MSG);

    assert!(matches!(old.accept().await, Err(CircuitError::ListenerClosed)));

    let mut conn = a.relay.dial_peer(&r.info(), &b.info()).await.unwrap();
    let mut data = Vec::new();
    conn.read_to_end(&mut data).await.unwrap();
    assert_eq!(data, MSG);
    served.await.unwrap();
}

#[tokio::test]
async fn test_full_backlog_refuses() {
    let network = MemoryNetwork::new();
    let a = node(&network, config());
    let r = node(&network, hop_config());
    let b = node(
        &network,
        config()
            .with_accept_backlog(1)
            .with_accept_timeout(Duration::from_millis(200)),
    );
    connect(&network, &a, &r);
    connect(&network, &r, &b);

    // Never accepted, so the first circuit fills the queue
    let _listener = b.relay.listener();
    let first = {
        let relay = a.relay.clone();
        let (r_info, b_info) = (r.info(), b.info());
        tokio::spawn(async move { relay.dial_peer(&r_info, &b_info).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = a.relay.dial_peer(&r.info(), &b.info()).await.unwrap_err();
    assert_eq!(err.relay_code(), Some(StatusCode::StopRelayRefused));
    first.abort();
}

/// Send `request` on a fresh relay stream from `from` to `to` and return the
/// status code of the reply
async fn raw_request(from: &MemoryHost, to: &PeerId, request: &RelayMessage) -> Option<StatusCode> {
    let mut stream = from.open_stream(to, PROTOCOL_ID).await.unwrap();
    MessageCodec::send_message(&mut stream, request).await.unwrap();
    MessageCodec::recv_message(&mut stream)
        .await
        .unwrap()
        .status_code()
}

fn with_long_addr(info: &PeerInfo, len: usize) -> PeerDescriptor {
    let mut descriptor = PeerDescriptor::from(info);
    descriptor.addrs.push(vec![b'a'; len]);
    descriptor
}

fn hop_request(src: PeerDescriptor, dst: PeerDescriptor) -> RelayMessage {
    RelayMessage {
        kind: MessageType::Hop,
        src_peer: Some(src),
        dst_peer: Some(dst),
        code: None,
    }
}

#[tokio::test]
async fn test_hop_rejects_long_addresses() {
    let network = MemoryNetwork::new();
    let (a, r, b) = relay_triangle(&network, hop_config());
    let (a_info, b_info) = (a.info(), b.info());

    let request = hop_request(with_long_addr(&a_info, MAX_ADDR_LEN + 1), (&b_info).into());
    assert_eq!(
        raw_request(&a.host, &r.id(), &request).await,
        Some(StatusCode::HopSrcAddrTooLong)
    );

    let request = hop_request((&a_info).into(), with_long_addr(&b_info, MAX_ADDR_LEN + 1));
    assert_eq!(
        raw_request(&a.host, &r.id(), &request).await,
        Some(StatusCode::HopDstAddrTooLong)
    );

    // The source is checked first
    let request = hop_request(
        with_long_addr(&a_info, MAX_ADDR_LEN + 1),
        with_long_addr(&b_info, MAX_ADDR_LEN + 1),
    );
    assert_eq!(
        raw_request(&a.host, &r.id(), &request).await,
        Some(StatusCode::HopSrcAddrTooLong)
    );

    // At the limit the address is parsed, and this one is not an address
    let request = hop_request(with_long_addr(&a_info, MAX_ADDR_LEN), (&b_info).into());
    assert_eq!(
        raw_request(&a.host, &r.id(), &request).await,
        Some(StatusCode::HopSrcMultiaddrInvalid)
    );
}

#[tokio::test]
async fn test_hop_rejects_invalid_descriptors() {
    let network = MemoryNetwork::new();
    let (a, r, b) = relay_triangle(&network, hop_config());
    let (a_info, b_info) = (a.info(), b.info());

    let short_id = PeerDescriptor {
        id: vec![1, 2, 3],
        addrs: Vec::new(),
    };
    let request = hop_request(short_id.clone(), (&b_info).into());
    assert_eq!(
        raw_request(&a.host, &r.id(), &request).await,
        Some(StatusCode::HopSrcMultiaddrInvalid)
    );

    // A well-formed source that is not the peer on the stream
    let impostor = PeerInfo::new(KeyPair::generate().peer_id());
    let request = hop_request((&impostor).into(), (&b_info).into());
    assert_eq!(
        raw_request(&a.host, &r.id(), &request).await,
        Some(StatusCode::HopSrcMultiaddrInvalid)
    );

    let mut bad_addr = PeerDescriptor::from(&a_info);
    bad_addr.addrs.push(b"/tcp/80".to_vec());
    let request = hop_request(bad_addr, (&b_info).into());
    assert_eq!(
        raw_request(&a.host, &r.id(), &request).await,
        Some(StatusCode::HopSrcMultiaddrInvalid)
    );

    let request = hop_request((&a_info).into(), short_id);
    assert_eq!(
        raw_request(&a.host, &r.id(), &request).await,
        Some(StatusCode::HopDstMultiaddrInvalid)
    );

    let mut missing_dst = hop_request((&a_info).into(), (&b_info).into());
    missing_dst.dst_peer = None;
    assert_eq!(
        raw_request(&a.host, &r.id(), &missing_dst).await,
        Some(StatusCode::HopDstMultiaddrInvalid)
    );
}

#[tokio::test]
async fn test_stop_rejects_bad_descriptors() {
    let network = MemoryNetwork::new();
    let a = node(&network, config());
    let b = node(&network, config());
    connect(&network, &a, &b);
    let _listener = b.relay.listener();
    let (a_info, b_info) = (a.info(), b.info());

    let cases = [
        (
            RelayMessage::stop(with_long_addr(&a_info, MAX_ADDR_LEN + 1), (&b_info).into()),
            StatusCode::StopSrcAddrTooLong,
        ),
        (
            RelayMessage::stop((&a_info).into(), with_long_addr(&b_info, MAX_ADDR_LEN + 1)),
            StatusCode::StopDstAddrTooLong,
        ),
        (
            RelayMessage::stop(PeerDescriptor::default(), (&b_info).into()),
            StatusCode::StopSrcMultiaddrInvalid,
        ),
        (
            RelayMessage::stop((&a_info).into(), PeerDescriptor::default()),
            StatusCode::StopDstMultiaddrInvalid,
        ),
    ];

    for (request, expected) in cases {
        assert_eq!(
            raw_request(&a.host, &b.id(), &request).await,
            Some(expected),
            "STOP expecting {}",
            expected
        );
    }
}

#[tokio::test]
async fn test_malformed_requests() {
    let network = MemoryNetwork::new();
    let a = node(&network, config());
    let r = node(&network, hop_config());
    connect(&network, &a, &r);

    let mut stream = a.host.open_stream(&r.id(), PROTOCOL_ID).await.unwrap();
    stream.write_all(&8u32.to_le_bytes()).await.unwrap();
    stream.write_all(&[0xff; 8]).await.unwrap();
    let reply = MessageCodec::recv_message(&mut stream).await.unwrap();
    assert_eq!(reply.status_code(), Some(StatusCode::MalformedMessage));

    let mut stream = a.host.open_stream(&r.id(), PROTOCOL_ID).await.unwrap();
    stream.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
    let reply = MessageCodec::recv_message(&mut stream).await.unwrap();
    assert_eq!(reply.status_code(), Some(StatusCode::MalformedMessage));

    let status_as_request = RelayMessage::status(StatusCode::Success);
    assert_eq!(
        raw_request(&a.host, &r.id(), &status_as_request).await,
        Some(StatusCode::MalformedMessage)
    );
}
