//! QUIC host tests over loopback

use circuitnet_common::{PeerInfo, RelayConfig};
use circuitnet_core::{Host, HostError, Identity, KeyPair, QuicHost, Relay, Stream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const ECHO: &str = "/test/echo/1.0.0";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn bind() -> Arc<QuicHost> {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    QuicHost::bind(Identity::generate(), addr).await.unwrap()
}

fn echo_handler(host: &QuicHost) {
    host.set_stream_handler(
        ECHO,
        Arc::new(|mut stream: Stream| {
            tokio::spawn(async move {
                let mut data = Vec::new();
                if stream.read_to_end(&mut data).await.is_ok() {
                    let _ = stream.write_all(&data).await;
                    let _ = stream.shutdown().await;
                }
            });
        }),
    );
}

async fn wait_connected(host: &QuicHost, peer: &circuitnet_common::PeerId) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !host.is_connected(peer) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_connect_authenticates_both_sides() {
    init_tracing();
    let a = bind().await;
    let b = bind().await;

    a.connect(&b.local_info()).await.unwrap();

    assert!(a.is_connected(&b.local_peer()));
    assert_eq!(a.connected_peers(), vec![b.local_peer()]);
    assert!(wait_connected(&b, &a.local_peer()).await);
    assert_eq!(a.peer_addr(&b.local_peer()), Some(b.local_addr()));

    // Already connected
    a.connect(&b.local_info()).await.unwrap();
}

#[tokio::test]
async fn test_stream_echo() {
    init_tracing();
    let a = bind().await;
    let b = bind().await;
    echo_handler(&b);
    a.connect(&b.local_info()).await.unwrap();

    let mut stream = a.open_stream(&b.local_peer(), ECHO).await.unwrap();
    assert_eq!(stream.protocol(), ECHO);
    assert_eq!(stream.remote_peer(), b.local_peer());

    stream.write_all(b"over quic").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    stream.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"over quic");
}

#[tokio::test]
async fn test_unsupported_protocol_rejected() {
    init_tracing();
    let a = bind().await;
    let b = bind().await;
    a.connect(&b.local_info()).await.unwrap();

    let err = a.open_stream(&b.local_peer(), ECHO).await.unwrap_err();
    assert!(matches!(err, HostError::ProtocolNotSupported { .. }));
}

#[tokio::test]
async fn test_open_stream_requires_connection() {
    let a = bind().await;
    let b = bind().await;

    let err = a.open_stream(&b.local_peer(), ECHO).await.unwrap_err();
    assert!(matches!(err, HostError::NotConnected(peer) if peer == b.local_peer()));
}

#[tokio::test]
async fn test_dial_checks_peer_identity() {
    let a = bind().await;
    let b = bind().await;

    let impostor = PeerInfo::with_addresses(KeyPair::generate().peer_id(), b.listen_addresses());
    let err = a.connect(&impostor).await.unwrap_err();
    assert!(matches!(
        err,
        HostError::PeerIdMismatch { actual, .. } if actual == b.local_peer()
    ));
    assert!(!a.is_connected(&impostor.id));

    let err = a
        .connect(&PeerInfo::new(b.local_peer()))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::NoAddresses(_)));
}

#[tokio::test]
async fn test_disconnect_emits_event() {
    let a = bind().await;
    let b = bind().await;
    let mut events = a.subscribe();

    a.connect(&b.local_info()).await.unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        circuitnet_core::HostEvent::Connected(b.local_peer())
    );

    assert!(a.disconnect(&b.local_peer()));
    assert_eq!(
        events.recv().await.unwrap(),
        circuitnet_core::HostEvent::Disconnected(b.local_peer())
    );
    assert!(!a.is_connected(&b.local_peer()));
}

#[tokio::test]
async fn test_relay_over_quic() {
    init_tracing();
    let a = bind().await;
    let r = bind().await;
    let b = bind().await;

    let config = RelayConfig::new().with_dial_timeout(Duration::from_secs(5));
    let a_relay = Relay::new(a.clone(), config.clone());
    let _r_relay = Relay::new(r.clone(), config.clone().with_hop(true));
    let b_relay = Relay::new(b.clone(), config);

    a.connect(&r.local_info()).await.unwrap();
    r.connect(&b.local_info()).await.unwrap();

    let mut listener = b_relay.listener();
    let served = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        let mut request = Vec::new();
        conn.read_to_end(&mut request).await.unwrap();
        conn.write_all(&request).await.unwrap();
        conn.shutdown().await.unwrap();
        conn.remote_peer()
    });

    let mut conn = a_relay
        .dial_peer(&r.local_info(), &PeerInfo::new(b.local_peer()))
        .await
        .unwrap();
    conn.write_all(b"through the relay").await.unwrap();
    conn.shutdown().await.unwrap();

    let mut reply = Vec::new();
    conn.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"through the relay");
    assert_eq!(served.await.unwrap(), a.local_peer());
}
