//! # sockeng-addr: host address value type
//!
//! Protocol-aware IPv4/IPv6 address representation used by the socket engine.
//!
//! ## Design
//!
//! - **Single canonical storage**: every address is held as 16 bytes. IPv4
//!   addresses are stored in v4-mapped form (`::ffff:a.b.c.d`) so that
//!   classification and comparison work on one representation. The 32-bit
//!   form is derived on demand.
//! - **Cheap clones**: the optional IPv6 scope id is reference counted.
//! - **Derived classification**: loopback, link-local, multicast and the
//!   other address classes are computed from the bytes, never stored.
//!
//! ## Module Organization
//!
//! - `host_address`: `HostAddress`, `SpecialAddress`, `NetworkLayerProtocol`,
//!   `ConversionMode` and `AddressClass`
//! - `subnet`: subnet parsing, membership tests and netmask conversion
//! - `error`: parse errors returned by the `FromStr` implementations

pub mod error;
pub mod host_address;
pub mod subnet;

pub use error::{AddressError, Result};
pub use host_address::{
    AddressClass, ConversionMode, HostAddress, NetworkLayerProtocol, SpecialAddress,
};
pub use subnet::{parse_subnet, Netmask};
