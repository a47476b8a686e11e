use circuitnet_common::protocol::HANDSHAKE_TIMEOUT_SECS;
use quinn::Endpoint as QuinnEndpoint;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Name presented in certificates; peers never verify it
const SERVER_NAME: &str = "circuitnet.local";

/// Idle connections are dropped after this long without traffic
const MAX_IDLE_TIMEOUT_SECS: u64 = 60;

const KEEP_ALIVE_SECS: u64 = 5;

const MAX_CONCURRENT_STREAMS: u32 = 256;

/// QUIC endpoint for creating connections
#[derive(Clone)]
pub struct Endpoint {
    /// Quinn endpoint
    inner: QuinnEndpoint,

    /// Local address
    local_addr: SocketAddr,
}

impl Endpoint {
    /// Create a new endpoint
    pub async fn new(config: EndpointConfig) -> Result<Self, EndpointError> {
        let server_config = Self::create_server_config()?;
        let client_config = Self::create_client_config()?;

        let mut endpoint = QuinnEndpoint::server(server_config, config.bind_addr)
            .map_err(|e| EndpointError::BindFailed(e.to_string()))?;

        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint.local_addr()?;

        Ok(Self {
            inner: endpoint,
            local_addr,
        })
    }

    /// Create server configuration with self-signed certificate
    fn create_server_config() -> Result<quinn::ServerConfig, EndpointError> {
        // Generate self-signed certificate
        let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
            .map_err(|e| EndpointError::CertGeneration(e.to_string()))?;

        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert_der)];
        let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
            .map_err(|e| EndpointError::CertGeneration(format!("Invalid key: {:?}", e)))?;

        // Create server config with crypto provider
        let server_crypto = rustls::ServerConfig::builder_with_provider(
                Arc::new(rustls::crypto::ring::default_provider())
            )
            .with_safe_default_protocol_versions()
            .map_err(|e| EndpointError::ConfigCreation(format!("Failed to set protocol versions: {:?}", e)))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| EndpointError::ConfigCreation(e.to_string()))?;

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| EndpointError::ConfigCreation(format!("Failed to create QUIC server config: {:?}", e)))?
        ));

        server_config.transport_config(Arc::new(Self::transport_config()?));

        Ok(server_config)
    }

    /// Create client configuration (accepts any certificate)
    fn create_client_config() -> Result<quinn::ClientConfig, EndpointError> {
        // Certificates are throwaway; identity is proven by the host handshake
        let crypto = rustls::ClientConfig::builder_with_provider(
                Arc::new(rustls::crypto::ring::default_provider())
            )
            .with_safe_default_protocol_versions()
            .map_err(|e| EndpointError::ConfigCreation(format!("Failed to set protocol versions: {:?}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| EndpointError::ConfigCreation(format!("Failed to create QUIC client config: {:?}", e)))?
        ));

        client_config.transport_config(Arc::new(Self::transport_config()?));

        Ok(client_config)
    }

    fn transport_config() -> Result<quinn::TransportConfig, EndpointError> {
        let idle = quinn::IdleTimeout::try_from(Duration::from_secs(MAX_IDLE_TIMEOUT_SECS))
            .map_err(|e| EndpointError::ConfigCreation(format!("Invalid idle timeout: {:?}", e)))?;

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Some(idle));
        transport_config.keep_alive_interval(Some(Duration::from_secs(KEEP_ALIVE_SECS)));
        transport_config.max_concurrent_bidi_streams(MAX_CONCURRENT_STREAMS.into());
        transport_config.max_concurrent_uni_streams(0u32.into());

        Ok(transport_config)
    }

    /// Connect to a remote endpoint
    pub async fn connect(&self, addr: SocketAddr) -> Result<super::Connection, EndpointError> {
        let connecting = self.inner
            .connect(addr, SERVER_NAME)
            .map_err(|e| EndpointError::ConnectionFailed(e.to_string()))?;

        let connection = tokio::time::timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), connecting)
            .await
            .map_err(|_| EndpointError::ConnectionFailed(format!("{} timed out", addr)))?
            .map_err(|e| EndpointError::ConnectionFailed(e.to_string()))?;

        Ok(super::Connection::new(connection))
    }

    /// Wait for the next incoming connection attempt
    pub async fn accept(&self) -> Result<Incoming, EndpointError> {
        let incoming = self.inner
            .accept()
            .await
            .ok_or(EndpointError::Closed)?;

        Ok(Incoming { inner: incoming })
    }

    /// Get local address
    /// If bound to 0.0.0.0, returns 127.0.0.1 instead for local connections
    pub fn local_addr(&self) -> SocketAddr {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(Ipv4Addr::LOCALHOST.into());
        }
        addr
    }

    /// Close the endpoint
    pub fn close(&self) {
        self.inner.close(0u32.into(), b"shutdown");
    }
}

/// A connection attempt that has not completed its QUIC handshake yet
pub struct Incoming {
    inner: quinn::Incoming,
}

impl Incoming {
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    /// Complete the QUIC handshake
    pub async fn establish(self) -> Result<super::Connection, EndpointError> {
        let connection = tokio::time::timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), self.inner)
            .await
            .map_err(|_| EndpointError::ConnectionFailed("handshake timed out".to_string()))?
            .map_err(|e| EndpointError::ConnectionFailed(e.to_string()))?;

        Ok(super::Connection::new(connection))
    }
}

/// Endpoint configuration
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        }
    }
}

impl EndpointConfig {
    /// Create configuration with specific bind address
    pub fn with_bind_addr(bind_addr: SocketAddr) -> Self {
        Self { bind_addr }
    }
}

/// Skip certificate verification for P2P network
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::ECDSA_SHA1_Legacy,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ED448,
        ]
    }
}

/// Endpoint errors
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    #[error("Failed to create config: {0}")]
    ConfigCreation(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Endpoint is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
