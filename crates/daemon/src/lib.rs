//! circuitnet daemon library
//!
//! Runs a QUIC host with a circuit relay attached, as configured by a
//! [`circuitnet_common::NodeConfig`].

pub mod node;

pub use node::{CircuitNode, NodeStats, IDENTITY_FILE};
