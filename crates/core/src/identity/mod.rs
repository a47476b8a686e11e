mod identity;
mod keypair;

pub use identity::{ExportableIdentity, Identity, IdentityError};
pub use keypair::{KeyPair, KeyPairError, PublicKey};
