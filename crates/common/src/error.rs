use thiserror::Error;

use crate::PeerIdError;

/// Errors produced while parsing textual network and peer addresses
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must start with '/': {0}")]
    MissingLeadingSlash(String),

    #[error("empty address")]
    Empty,

    #[error("unknown protocol segment: {0}")]
    UnknownProtocol(String),

    #[error("missing value for /{0}")]
    MissingValue(&'static str),

    #[error("invalid value for /{protocol}: {value}")]
    InvalidValue {
        protocol: &'static str,
        value: String,
    },

    #[error("unexpected trailing segments: {0}")]
    Trailing(String),

    #[error("missing /p2p/<peer-id> component")]
    MissingPeerId,

    #[error("invalid peer id: {0}")]
    PeerId(#[from] PeerIdError),
}
