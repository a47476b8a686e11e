use circuitnet_common::PeerId;
use std::time::Duration;

use super::address::CircuitAddressError;
use crate::host::HostError;
use crate::protocol::{CodecError, MessageType, StatusCode};

/// A circuit refused by a relay or destination, carrying the protocol status
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("relay refused circuit: {code}")]
pub struct RelayError {
    pub code: StatusCode,
}

impl RelayError {
    pub fn new(code: StatusCode) -> Self {
        Self { code }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }
}

impl From<StatusCode> for RelayError {
    fn from(code: StatusCode) -> Self {
        Self::new(code)
    }
}

/// Errors surfaced by relay operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected {0} message in reply")]
    UnexpectedResponse(MessageType),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("no usable relay to reach {destination} ({tried} tried)")]
    NoUsableRelay { destination: PeerId, tried: usize },

    #[error("invalid circuit address: {0}")]
    Address(#[from] CircuitAddressError),

    #[error("relay listener closed")]
    ListenerClosed,
}

impl CircuitError {
    /// Protocol status code, when the failure was a refusal
    pub fn relay_code(&self) -> Option<StatusCode> {
        match self {
            Self::Relay(err) => Some(err.code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_error_display() {
        let err = RelayError::new(StatusCode::HopCantSpeakRelay);
        assert_eq!(
            err.to_string(),
            "relay refused circuit: HOP_CANT_SPEAK_RELAY (270)"
        );
    }

    #[test]
    fn test_relay_code() {
        let err: CircuitError = RelayError::new(StatusCode::StopRelayRefused).into();
        assert_eq!(err.relay_code(), Some(StatusCode::StopRelayRefused));
        assert_eq!(err.to_string(), "relay refused circuit: STOP_RELAY_REFUSED (390)");

        let timeout = CircuitError::Timeout(Duration::from_secs(1));
        assert_eq!(timeout.relay_code(), None);
        assert!(timeout.is_timeout());
    }
}
