use super::{KeyPair, PublicKey};
use circuitnet_common::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::info;

/// Complete identity for a peer
///
/// Contains the keypair and the derived PeerId
#[derive(Clone)]
pub struct Identity {
    keypair: KeyPair,
    peer_id: PeerId,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::from_keypair(KeyPair::generate())
    }

    /// Create an identity from an existing keypair
    pub fn from_keypair(keypair: KeyPair) -> Self {
        let peer_id = keypair.peer_id();
        Self { keypair, peer_id }
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.keypair.sign(message)
    }

    /// Export to a saveable format
    pub fn to_exportable(&self) -> ExportableIdentity {
        ExportableIdentity {
            secret_key: self.keypair.secret_bytes(),
        }
    }

    /// Import from a saved format
    pub fn from_exportable(exportable: &ExportableIdentity) -> Self {
        Self::from_keypair(KeyPair::from_secret_bytes(&exportable.secret_key))
    }

    /// Load the identity stored at `path`, creating and saving a new one if
    /// the file does not exist yet
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            info!("Loading identity from {:?}", path);
            let json = std::fs::read_to_string(path)?;
            let exportable = ExportableIdentity::from_json(&json)?;
            return Ok(Self::from_exportable(&exportable));
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, identity.to_exportable().to_json()?)?;
        info!("Generated new identity {} at {:?}", identity.peer_id, path);

        Ok(identity)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .field("public_key", &self.public_key())
            .finish()
    }
}

/// Exportable/serializable format for saving identity to disk
#[derive(Serialize, Deserialize)]
pub struct ExportableIdentity {
    secret_key: [u8; 32],
}

impl ExportableIdentity {
    /// Save to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity file i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("identity file format: {0}")]
    Format(#[from] serde_json::Error),
}
