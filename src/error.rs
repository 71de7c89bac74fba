//! Error types for the DHCPv6 server.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv6Addr;

/// Errors that can occur during DHCPv6 server operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease journal).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCPv6 message or option received.
    ///
    /// Covers truncated headers, option lengths that overrun their
    /// container, fixed-size payloads of the wrong size and unknown
    /// message types. Aborts the whole reply being built.
    #[error("Invalid DHCPv6 packet: {0}")]
    InvalidPacket(String),

    /// No eligible pool could supply an address or prefix.
    ///
    /// Allocation is probabilistic, so this is reported after a bounded
    /// number of hash attempts, not after an exhaustive scan.
    #[error("No addresses or prefixes available")]
    NoResources,

    /// The requested address or prefix is held by another lease.
    #[error("Address {0} is already in use")]
    AddressInUse(Ipv6Addr),

    /// The requested address or prefix does not fall inside the pool.
    #[error("Address {0} is not in any eligible pool")]
    NotInPool(Ipv6Addr),

    /// The reply would exceed the maximum DHCPv6 message size.
    #[error("Reply exceeds the maximum message size")]
    NoSpace,

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) when the
    /// configuration contains invalid values (e.g. a pool outside every
    /// subnet of its shared network).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 547 without administrator
    /// privileges, or when joining the All_DHCP_Relay_Agents_and_Servers
    /// group on an interface that doesn't exist.
    #[error("Socket error: {0}")]
    Socket(String),

    /// No lease exists for the specified key.
    #[error("Lease {0} not found")]
    LeaseNotFound(String),

    /// An internal invariant did not hold.
    ///
    /// Never reachable from well-formed input. Terminates the request that
    /// hit it, not the server.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for DHCPv6 operations.
pub type Result<T> = std::result::Result<T, Error>;
