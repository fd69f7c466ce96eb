//! Builder patterns for convenient object construction

pub mod network;

pub use network::NetworkBuilder;
