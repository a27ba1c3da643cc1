//! Subnet parsing and netmask conversion.
//!
//! Accepted subnet forms:
//! - `a.b.c.d/nn`, `a.b.c/nn`, `a.b/nn`, `a/nn`
//! - `a.b.c.d/m.m.m.m` (contiguous dotted netmask)
//! - partial dotted quads with no prefix (`"192.168"` implies `/16`),
//!   optionally with a trailing dot
//! - `<ipv6-address>/nn` (no prefix implies `/128`)

use crate::error::AddressError;
use crate::host_address::{HostAddress, NetworkLayerProtocol};

/// Pair returned for unparseable subnets.
fn invalid() -> (HostAddress, i32) {
    (HostAddress::null(), -1)
}

/// Parse a subnet into its network address and prefix length.
///
/// Host bits beyond the prefix are cleared in the returned address. Invalid
/// input yields `(null address, -1)`.
pub fn parse_subnet(subnet: &str) -> (HostAddress, i32) {
    if subnet.is_empty() {
        return invalid();
    }

    let (net_str, mask_str) = match subnet.split_once('/') {
        Some((net, mask)) => (net, Some(mask)),
        None => (subnet, None),
    };
    let is_ipv6 = net_str.contains(':');

    let mut prefix: i32 = -1;
    if let Some(mask_str) = mask_str {
        if !is_ipv6 && mask_str.contains('.') {
            let Some(mask) = HostAddress::parse(mask_str) else {
                return invalid();
            };
            match Netmask::from_address(&mask) {
                Some(netmask) => prefix = i32::from(netmask.prefix_length()),
                None => return invalid(),
            }
        } else {
            match mask_str.parse::<u32>() {
                Ok(value) if value <= 128 => prefix = value as i32,
                _ => return invalid(),
            }
        }
    }

    if is_ipv6 {
        let Some(mut net) = HostAddress::parse(net_str) else {
            return invalid();
        };
        if prefix < 0 {
            prefix = 128;
        }
        clear_bits(net.bytes_mut(), prefix as usize);
        return (net, prefix);
    }

    if prefix > 32 {
        return invalid();
    }

    let mut parts: Vec<&str> = net_str.split('.').collect();
    if parts.len() > 4 {
        return invalid();
    }
    if parts.last().is_some_and(|last| last.is_empty()) {
        parts.pop();
    }

    let mut addr: u32 = 0;
    for i in 0..4 {
        addr <<= 8;
        if let Some(part) = parts.get(i) {
            match part.parse::<u32>() {
                Ok(byte) if byte <= 255 => addr += byte,
                _ => return invalid(),
            }
        }
    }

    if prefix == -1 {
        prefix = 8 * parts.len() as i32;
    } else if prefix == 0 {
        addr = 0;
    } else if prefix != 32 {
        addr &= !(u32::MAX >> prefix);
    }

    (HostAddress::from_ipv4_u32(addr), prefix)
}

/// Zero every bit from `from_bit` to the end of the address.
fn clear_bits(bytes: &mut [u8; 16], from_bit: usize) {
    if from_bit >= 128 {
        return;
    }
    let first = from_bit / 8;
    let rest = from_bit % 8;
    let mut start = first;
    if rest != 0 {
        bytes[first] &= 0xffu8 << (8 - rest);
        start += 1;
    }
    for byte in &mut bytes[start..] {
        *byte = 0;
    }
}

/// Prefix-length netmask for one address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Netmask {
    length: u8,
    protocol: NetworkLayerProtocol,
}

impl Netmask {
    /// Build from an address form such as `255.255.240.0` or `ffff:ffff::`.
    ///
    /// Returns `None` unless the one bits are contiguous from the top.
    pub fn from_address(mask: &HostAddress) -> Option<Self> {
        match mask.protocol() {
            NetworkLayerProtocol::Ipv4 => {
                let value = mask.to_ipv4()?;
                let length = value.leading_ones();
                (value.count_ones() == length).then_some(Self {
                    length: length as u8,
                    protocol: NetworkLayerProtocol::Ipv4,
                })
            }
            NetworkLayerProtocol::Ipv6 => {
                let value = u128::from_be_bytes(mask.to_ipv6_bytes());
                let length = value.leading_ones();
                (value.count_ones() == length).then_some(Self {
                    length: length as u8,
                    protocol: NetworkLayerProtocol::Ipv6,
                })
            }
            _ => None,
        }
    }

    /// Build from a prefix length, which must fit the family width.
    pub fn from_prefix_length(
        protocol: NetworkLayerProtocol,
        length: u8,
    ) -> Result<Self, AddressError> {
        let width = match protocol {
            NetworkLayerProtocol::Ipv4 => 32,
            NetworkLayerProtocol::Ipv6 => 128,
            _ => return Err(AddressError::InvalidNetmask(format!("/{}", length))),
        };
        if length > width {
            return Err(AddressError::InvalidNetmask(format!("/{}", length)));
        }
        Ok(Self { length, protocol })
    }

    pub fn prefix_length(&self) -> u8 {
        self.length
    }

    /// The mask as an address, e.g. `/20` becomes `255.255.240.0`.
    pub fn to_address(&self) -> HostAddress {
        match self.protocol {
            NetworkLayerProtocol::Ipv4 => {
                let value = u32::MAX.checked_shl(32 - u32::from(self.length)).unwrap_or(0);
                HostAddress::from_ipv4_u32(value)
            }
            _ => {
                let value = u128::MAX.checked_shl(128 - u32::from(self.length)).unwrap_or(0);
                HostAddress::from_ipv6_bytes(value.to_be_bytes())
            }
        }
    }
}
