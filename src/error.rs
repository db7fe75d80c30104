//! Unified error types for sitenet

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for sitenet operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    /// A rule or site setting required by the caller is missing
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Address and request errors
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Allocation errors
    #[error("No free address available on vlan {vlan}")]
    AllocationExhausted { vlan: u16 },

    #[error("Address {ip} on vlan {vlan} is already taken")]
    AddressTaken { vlan: u16, ip: Ipv4Addr },

    #[error("Liveness probe unavailable: {0}")]
    ProbeUnavailable(String),

    // Record store errors
    #[error("Failed to read record store '{path}': {source}")]
    StoreRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse record store: {0}")]
    StoreParse(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    RecordNotFound(String),
}

/// Result type alias for sitenet operations
pub type Result<T> = std::result::Result<T, Error>;
