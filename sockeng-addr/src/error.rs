//! Error types for address parsing.

use thiserror::Error;

/// Result type for address operations.
pub type Result<T> = std::result::Result<T, AddressError>;

/// Errors produced when text cannot be turned into an address value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Not a dotted-quad IPv4 or textual IPv6 address.
    #[error("invalid host address: {0:?}")]
    InvalidAddress(String),

    /// Not a valid `address/prefix` or `address/netmask` subnet.
    #[error("invalid subnet: {0:?}")]
    InvalidSubnet(String),

    /// Netmask is not a contiguous run of one bits.
    #[error("invalid netmask: {0:?}")]
    InvalidNetmask(String),
}
