//! Error types for the StrobeScan core library

use std::io;
use std::net::AddrParseError;
use thiserror::Error;

/// Result type alias for StrobeScan operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared by all StrobeScan crates
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid addresses, port syntax, module names, conflicting flags.
    /// Fatal before the scan starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cannot open the capture/send handle or resolve the source identity.
    /// Fatal before the scan starts.
    #[error("Bind error: {0}")]
    Bind(String),

    /// Invalid target specification (address or range syntax)
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Invalid port specification
    #[error("Invalid port range: {0}")]
    InvalidPortRange(String),

    /// Transient transmit failure; the packet is dropped and the scan
    /// continues
    #[error("Transmit error: {0}")]
    Transmit(String),

    /// A ring was full when a handler tried to emit a response packet.
    /// Indicates sizing misconfiguration and aborts the scan.
    #[error("Backpressure: {0}")]
    Backpressure(String),

    /// A probe callback returned a negative decision
    #[error("Probe error: {0}")]
    Probe(String),

    /// I/O errors with automatic conversion
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error (resume file, output records)
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::InvalidTarget(format!("invalid IP address: {}", err))
    }
}

impl From<ipnetwork::IpNetworkError> for Error {
    fn from(err: ipnetwork::IpNetworkError) -> Self {
        Error::InvalidTarget(format!("invalid IP network: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("TOML parse error: {}", err))
    }
}
