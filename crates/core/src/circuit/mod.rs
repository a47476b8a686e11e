//! The circuit-relay engine.
//!
//! A [`Relay`] bound to a host plays all three roles of a circuit: it dials
//! through relays as a source, forwards circuits for others when configured
//! with `hop`, and hands circuits addressed to this host to a
//! [`RelayListener`].

mod address;
mod conn;
mod dialer;
mod error;
mod hop;
mod listener;
mod relay;
pub mod splice;

pub use address::{CircuitAddress, CircuitAddressError, CIRCUIT_SEGMENT};
pub use conn::RelayedConn;
pub use dialer::CircuitDialer;
pub use error::{CircuitError, RelayError};
pub use listener::RelayListener;
pub use relay::Relay;
pub use splice::{splice, SpliceReport};
