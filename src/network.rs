//! IPv4 address handling
//!
//! Provides:
//! - CIDR arithmetic (netmask, network, wildcard, broadcast, membership)
//! - Address sequence generation
//! - MAC derivation and OID conversion

pub mod cidr;
pub mod mac;
pub mod range;

pub use cidr::Cidr;
pub use range::generate_range;
