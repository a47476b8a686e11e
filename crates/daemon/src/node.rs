use anyhow::{Context, Result};
use circuitnet_common::{NodeConfig, PeerId, PeerInfo};
use circuitnet_core::{Host, Identity, QuicHost, Relay, RelayedConn};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// File in the data directory holding the node identity
pub const IDENTITY_FILE: &str = "identity.json";

/// A running node: QUIC host, relay and (optionally) an echo service for
/// circuits addressed to it
pub struct CircuitNode {
    host: Arc<QuicHost>,
    relay: Relay,
    echo_task: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
pub struct NodeStats {
    pub peer_id: PeerId,
    pub listen_addr: SocketAddr,
    pub connected_peers: usize,
    pub known_relays: usize,
    pub hop: bool,
    pub active: bool,
}

impl CircuitNode {
    pub async fn start(config: &NodeConfig) -> Result<Self> {
        let identity_path = Path::new(&config.data_dir).join(IDENTITY_FILE);
        let identity = Identity::load_or_generate(&identity_path)
            .with_context(|| format!("loading identity from {:?}", identity_path))?;

        let listen_addr = config.listen_socket_addr()?;
        let host = QuicHost::bind(identity, listen_addr)
            .await
            .with_context(|| format!("binding {}", listen_addr))?;
        let relay = Relay::new(host.clone(), config.relay.clone());

        for peer in config.bootstrap_peer_infos()? {
            match host.connect(&peer).await {
                Ok(()) => info!("Connected to bootstrap peer {}", peer.id.short_hex()),
                Err(e) => warn!("Failed to connect to bootstrap peer {}: {}", peer, e),
            }
        }

        let echo_task = config.accept_relayed.then(|| spawn_echo(&relay));

        info!("Node {} started on {}", host.local_peer(), host.local_addr());
        Ok(Self {
            host,
            relay,
            echo_task,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.host.local_peer()
    }

    /// Identity and address other nodes can dial this one at
    pub fn local_info(&self) -> PeerInfo {
        self.host.local_info()
    }

    pub fn host(&self) -> &Arc<QuicHost> {
        &self.host
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            peer_id: self.peer_id(),
            listen_addr: self.host.local_addr(),
            connected_peers: self.host.connected_peers().len(),
            known_relays: self.relay.known_relays().len(),
            hop: self.relay.config().hop,
            active: self.relay.config().active,
        }
    }

    pub fn stop(mut self) {
        if let Some(task) = self.echo_task.take() {
            task.abort();
        }
        self.host.close();
        info!("Node {} stopped", self.peer_id().short_hex());
    }
}

fn spawn_echo(relay: &Relay) -> JoinHandle<()> {
    let mut listener = relay.listener();
    tokio::spawn(async move {
        while let Ok(conn) = listener.accept().await {
            tokio::spawn(echo(conn));
        }
        debug!("Relay listener closed");
    })
}

/// Write back everything the remote sends until it closes its side
async fn echo(conn: RelayedConn) {
    let remote = conn.remote_peer();
    info!(
        "Echoing circuit from {} via {}",
        remote.short_hex(),
        conn.relay_peer().short_hex()
    );

    let (mut reader, mut writer) = tokio::io::split(conn);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => {
            let _ = writer.shutdown().await;
            debug!("Echoed {} bytes to {}", bytes, remote.short_hex());
        }
        Err(e) => debug!("Echo to {} ended: {}", remote.short_hex(), e),
    }
}
