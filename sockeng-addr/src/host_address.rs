//! IPv4/IPv6 host address with classification and protocol-aware comparison.
//!
//! Addresses are stored as 16 canonical bytes. An IPv4 address `a.b.c.d` is
//! kept as `::ffff:a.b.c.d`, except `0.0.0.0` which is kept as all zeros so
//! that it classifies the same way as `::`.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::AddressError;

/// Network layer protocol of an address or socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkLayerProtocol {
    Ipv4,
    Ipv6,
    /// Either family. Used for dual-stack sockets and the `Any` address.
    AnyIp,
    #[default]
    Unknown,
}

/// Well-known addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialAddress {
    Null,
    Broadcast,
    LocalHost,
    LocalHostIpv6,
    Any,
    AnyIpv6,
    AnyIpv4,
}

bitflags! {
    /// Controls which cross-family conversions [`HostAddress::is_equal`] may apply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConversionMode: u8 {
        /// `::ffff:a.b.c.d` compares equal to `a.b.c.d`.
        const CONVERT_V4_MAPPED_TO_IPV4 = 0x01;
        /// `::a.b.c.d` compares equal to `a.b.c.d`.
        const CONVERT_V4_COMPAT_TO_IPV4 = 0x02;
        /// `::`, `0.0.0.0` and the `Any` address compare equal.
        const CONVERT_UNSPECIFIED_ADDRESS = 0x04;
        /// `::1` compares equal to `127.0.0.1`.
        const CONVERT_LOCAL_HOST = 0x08;
        /// Every conversion.
        const TOLERANT = 0xff;
    }
}

impl ConversionMode {
    /// No conversions. Families must match exactly.
    pub const STRICT: Self = Self::empty();
}

/// Address block classification, in the order [`HostAddress::classify`] tests them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AddressClass {
    Loopback = 1,
    /// `0.0.0.0/8`, `::` and `::ffff:0.0.0.0`.
    LocalNet,
    /// RFC 1918 blocks.
    PrivateNetwork,
    LinkLocal,
    UniqueLocal,
    /// `fec0::/10`, deprecated by RFC 3879.
    SiteLocal,
    /// Reserved blocks such as `240.0.0.0/4` and `fe00::/9`.
    Unknown,
    Multicast,
    Broadcast,
    Global = 16,
}

const INADDR_LOOPBACK: u32 = 0x7f00_0001;
const INADDR_BROADCAST: u32 = 0xffff_ffff;

/// IPv4 or IPv6 address, or one of the special addresses.
///
/// Equality (`==`) is strict: addresses of different families are never
/// equal. Use [`HostAddress::is_equal`] with a [`ConversionMode`] for
/// cross-family comparison. The IPv6 scope id does not take part in either.
#[derive(Clone, Default)]
pub struct HostAddress {
    bytes: [u8; 16],
    protocol: NetworkLayerProtocol,
    scope_id: Option<Arc<str>>,
}

impl HostAddress {
    /// The null address (protocol `Unknown`).
    pub const fn null() -> Self {
        Self {
            bytes: [0; 16],
            protocol: NetworkLayerProtocol::Unknown,
            scope_id: None,
        }
    }

    /// IPv4 address from its host-order 32-bit value.
    pub fn from_ipv4_u32(ip4: u32) -> Self {
        let mut bytes = [0u8; 16];
        if ip4 != 0 {
            bytes[10] = 0xff;
            bytes[11] = 0xff;
            bytes[12..].copy_from_slice(&ip4.to_be_bytes());
        }
        Self {
            bytes,
            protocol: NetworkLayerProtocol::Ipv4,
            scope_id: None,
        }
    }

    /// IPv6 address from its 16 network-order bytes.
    pub fn from_ipv6_bytes(bytes: [u8; 16]) -> Self {
        Self {
            bytes,
            protocol: NetworkLayerProtocol::Ipv6,
            scope_id: None,
        }
    }

    /// Parse a dotted-quad IPv4 address or a textual IPv6 address with an
    /// optional `%scope` suffix. Surrounding whitespace is ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.contains(':') {
            let (addr, scope) = match text.split_once('%') {
                Some((addr, scope)) => (addr, Some(scope)),
                None => (text, None),
            };
            let ip6: Ipv6Addr = addr.parse().ok()?;
            let mut address = Self::from(ip6);
            if let Some(scope) = scope {
                if scope.is_empty() {
                    return None;
                }
                address.scope_id = Some(Arc::from(scope));
            }
            Some(address)
        } else {
            text.parse::<Ipv4Addr>().ok().map(Self::from)
        }
    }

    /// Reset to the null address.
    pub fn clear(&mut self) {
        *self = Self::null();
    }

    pub fn protocol(&self) -> NetworkLayerProtocol {
        self.protocol
    }

    pub fn is_null(&self) -> bool {
        self.protocol == NetworkLayerProtocol::Unknown
    }

    /// Host-order IPv4 value.
    ///
    /// Available for IPv4 and `Any` addresses, and for IPv6 addresses that
    /// are v4-mapped or unspecified.
    pub fn to_ipv4(&self) -> Option<u32> {
        match self.protocol {
            NetworkLayerProtocol::Ipv4 | NetworkLayerProtocol::AnyIp => Some(self.embedded_ipv4()),
            NetworkLayerProtocol::Ipv6 => convert_to_ipv4(
                &self.bytes,
                ConversionMode::CONVERT_V4_MAPPED_TO_IPV4
                    | ConversionMode::CONVERT_UNSPECIFIED_ADDRESS,
            ),
            NetworkLayerProtocol::Unknown => None,
        }
    }

    /// Canonical 16-byte form. IPv4 addresses come back v4-mapped.
    pub fn to_ipv6_bytes(&self) -> [u8; 16] {
        self.bytes
    }

    pub fn scope_id(&self) -> Option<&str> {
        self.scope_id.as_deref()
    }

    /// Set the IPv6 scope id. Ignored for other protocols.
    pub fn set_scope_id(&mut self, scope: Option<&str>) {
        if self.protocol == NetworkLayerProtocol::Ipv6 {
            self.scope_id = scope.filter(|s| !s.is_empty()).map(Arc::from);
        }
    }

    /// Convert to a standard library address.
    ///
    /// `Any` maps to `::`, since dual-stack sockets bind the IPv6 wildcard.
    pub fn to_ip_addr(&self) -> Option<IpAddr> {
        match self.protocol {
            NetworkLayerProtocol::Ipv4 => Some(IpAddr::V4(Ipv4Addr::from(self.embedded_ipv4()))),
            NetworkLayerProtocol::Ipv6 | NetworkLayerProtocol::AnyIp => {
                Some(IpAddr::V6(Ipv6Addr::from(self.bytes)))
            }
            NetworkLayerProtocol::Unknown => None,
        }
    }

    /// Family-aware comparison honouring `mode`.
    pub fn is_equal(&self, other: &HostAddress, mode: ConversionMode) -> bool {
        use NetworkLayerProtocol::*;

        let unspecified = mode.contains(ConversionMode::CONVERT_UNSPECIFIED_ADDRESS);
        match (self.protocol, other.protocol) {
            (Ipv4, Ipv4) | (Ipv6, Ipv6) => self.bytes == other.bytes,
            (Ipv4, Ipv6) => {
                convert_to_ipv4(&other.bytes, mode) == Some(self.embedded_ipv4())
            }
            (Ipv6, Ipv4) => {
                convert_to_ipv4(&self.bytes, mode) == Some(other.embedded_ipv4())
            }
            (Ipv4, AnyIp) | (AnyIp, Ipv4) | (Ipv6, AnyIp) | (AnyIp, Ipv6) => {
                let concrete = if self.protocol == AnyIp { other } else { self };
                unspecified && concrete.bytes == [0; 16]
            }
            (a, b) => a == b,
        }
    }

    /// Classify by address block.
    pub fn classify(&self) -> AddressClass {
        let ip4 = self.mapped_ipv4();
        if ip4 != 0 {
            return classify_ipv4(ip4);
        }

        let value = u128::from_be_bytes(self.bytes);
        let high = (value >> 64) as u64;
        if high != 0 {
            let high16 = (high >> 48) as u16;
            return match high16 >> 8 {
                0xff => AddressClass::Multicast,
                0xfe => match high16 & 0xffc0 {
                    0xfec0 => AddressClass::SiteLocal,
                    0xfe80 => AddressClass::LinkLocal,
                    _ => AddressClass::Unknown,
                },
                0xfc | 0xfd => AddressClass::UniqueLocal,
                _ => AddressClass::Global,
            };
        }

        match value as u64 {
            1 => AddressClass::Loopback,
            0 => AddressClass::LocalNet,
            // ::ffff:0.0.0.0
            0x0000_ffff_0000_0000 => AddressClass::LocalNet,
            _ => AddressClass::Global,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.classify() == AddressClass::Loopback
    }

    pub fn is_link_local(&self) -> bool {
        self.classify() == AddressClass::LinkLocal
    }

    pub fn is_site_local(&self) -> bool {
        self.classify() == AddressClass::SiteLocal
    }

    pub fn is_unique_local_unicast(&self) -> bool {
        self.classify() == AddressClass::UniqueLocal
    }

    pub fn is_multicast(&self) -> bool {
        self.classify() == AddressClass::Multicast
    }

    pub fn is_broadcast(&self) -> bool {
        self.classify() == AddressClass::Broadcast
    }

    pub fn is_global(&self) -> bool {
        (self.classify() as u8) & (AddressClass::Global as u8) != 0
    }

    /// RFC 1918 IPv4 blocks and IPv6 unique-local addresses.
    pub fn is_private_use(&self) -> bool {
        matches!(
            self.classify(),
            AddressClass::PrivateNetwork | AddressClass::UniqueLocal
        )
    }

    /// True if the first `prefix_length` bits match `network`.
    ///
    /// Both addresses must have the same protocol. The prefix is clamped to
    /// the family width; a negative prefix never matches.
    pub fn is_in_subnet(&self, network: &HostAddress, prefix_length: i32) -> bool {
        if network.protocol != self.protocol || prefix_length < 0 {
            return false;
        }

        let (ours, theirs, width): (&[u8], &[u8], i32) = match self.protocol {
            NetworkLayerProtocol::Ipv4 => (&self.bytes[12..], &network.bytes[12..], 32),
            NetworkLayerProtocol::Ipv6 => (&self.bytes[..], &network.bytes[..], 128),
            _ => return false,
        };

        let prefix = prefix_length.min(width) as usize;
        let whole = prefix / 8;
        if ours[..whole] != theirs[..whole] {
            return false;
        }
        let rest = prefix % 8;
        if rest == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rest);
        ours[whole] & mask == theirs[whole] & mask
    }

    /// IPv4 value held in the last four bytes (zero for `0.0.0.0`).
    fn embedded_ipv4(&self) -> u32 {
        u32::from_be_bytes([self.bytes[12], self.bytes[13], self.bytes[14], self.bytes[15]])
    }

    /// Non-zero only for addresses in `::ffff:0:0/96` other than `::ffff:0.0.0.0`.
    fn mapped_ipv4(&self) -> u32 {
        convert_to_ipv4(&self.bytes, ConversionMode::CONVERT_V4_MAPPED_TO_IPV4).unwrap_or(0)
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8; 16] {
        &mut self.bytes
    }
}

fn classify_ipv4(ip4: u32) -> AddressClass {
    if ip4 & 0xff00_0000 == 0x7f00_0000 {
        AddressClass::Loopback
    } else if ip4 & 0xf000_0000 == 0xe000_0000 {
        AddressClass::Multicast
    } else if ip4 & 0xffff_0000 == 0xa9fe_0000 {
        AddressClass::LinkLocal
    } else if ip4 & 0xff00_0000 == 0 {
        AddressClass::LocalNet
    } else if ip4 & 0xf000_0000 == 0xf000_0000 {
        if ip4 == INADDR_BROADCAST {
            AddressClass::Broadcast
        } else {
            AddressClass::Unknown
        }
    } else if ip4 & 0xff00_0000 == 0x0a00_0000
        || ip4 & 0xfff0_0000 == 0xac10_0000
        || ip4 & 0xffff_0000 == 0xc0a8_0000
    {
        AddressClass::PrivateNetwork
    } else {
        AddressClass::Global
    }
}

/// Extract an IPv4 value from 16 address bytes if `mode` allows it.
fn convert_to_ipv4(bytes: &[u8; 16], mode: ConversionMode) -> Option<u32> {
    if mode.is_empty() || bytes[..8] != [0; 8] {
        return None;
    }
    let mid = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let low = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

    if mid == 0xffff && mode.contains(ConversionMode::CONVERT_V4_MAPPED_TO_IPV4) {
        return Some(low);
    }
    if mid != 0 {
        return None;
    }
    if low == 0 && mode.contains(ConversionMode::CONVERT_UNSPECIFIED_ADDRESS) {
        return Some(0);
    }
    if low == 1 && mode.contains(ConversionMode::CONVERT_LOCAL_HOST) {
        return Some(INADDR_LOOPBACK);
    }
    if !mode.contains(ConversionMode::CONVERT_V4_COMPAT_TO_IPV4) {
        return None;
    }
    Some(low)
}

impl PartialEq for HostAddress {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.bytes == other.bytes
    }
}

impl Eq for HostAddress {}

impl Hash for HostAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.bytes.hash(state);
    }
}

impl PartialEq<SpecialAddress> for HostAddress {
    fn eq(&self, other: &SpecialAddress) -> bool {
        let ip4 = match other {
            SpecialAddress::Null => return self.protocol == NetworkLayerProtocol::Unknown,
            SpecialAddress::Any => return self.protocol == NetworkLayerProtocol::AnyIp,
            SpecialAddress::LocalHostIpv6 | SpecialAddress::AnyIpv6 => {
                let mut expected = [0u8; 16];
                if *other == SpecialAddress::LocalHostIpv6 {
                    expected[15] = 1;
                }
                return self.protocol == NetworkLayerProtocol::Ipv6 && self.bytes == expected;
            }
            SpecialAddress::Broadcast => INADDR_BROADCAST,
            SpecialAddress::LocalHost => INADDR_LOOPBACK,
            SpecialAddress::AnyIpv4 => 0,
        };
        self.protocol == NetworkLayerProtocol::Ipv4 && self.embedded_ipv4() == ip4
    }
}

impl From<SpecialAddress> for HostAddress {
    fn from(special: SpecialAddress) -> Self {
        match special {
            SpecialAddress::Null => Self::null(),
            SpecialAddress::Broadcast => Self::from_ipv4_u32(INADDR_BROADCAST),
            SpecialAddress::LocalHost => Self::from_ipv4_u32(INADDR_LOOPBACK),
            SpecialAddress::AnyIpv4 => Self::from_ipv4_u32(0),
            SpecialAddress::LocalHostIpv6 => Self::from(Ipv6Addr::LOCALHOST),
            SpecialAddress::AnyIpv6 => Self::from(Ipv6Addr::UNSPECIFIED),
            SpecialAddress::Any => Self {
                bytes: [0; 16],
                protocol: NetworkLayerProtocol::AnyIp,
                scope_id: None,
            },
        }
    }
}

impl From<Ipv4Addr> for HostAddress {
    fn from(ip: Ipv4Addr) -> Self {
        Self::from_ipv4_u32(u32::from(ip))
    }
}

impl From<Ipv6Addr> for HostAddress {
    fn from(ip: Ipv6Addr) -> Self {
        Self::from_ipv6_bytes(ip.octets())
    }
}

impl From<IpAddr> for HostAddress {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

/// Port is discarded. A non-zero IPv6 scope becomes a numeric scope id.
impl From<SocketAddr> for HostAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => (*v4.ip()).into(),
            SocketAddr::V6(v6) => {
                let mut address = HostAddress::from(*v6.ip());
                if v6.scope_id() != 0 {
                    address.scope_id = Some(Arc::from(v6.scope_id().to_string()));
                }
                address
            }
        }
    }
}

impl FromStr for HostAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| AddressError::InvalidAddress(s.to_string()))
    }
}

/// Dotted quad for IPv4, RFC 5952 text with optional `%scope` for IPv6,
/// `::` for `Any` and the empty string for the null address.
impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            NetworkLayerProtocol::Ipv4 => fmt::Display::fmt(&Ipv4Addr::from(self.embedded_ipv4()), f),
            NetworkLayerProtocol::Ipv6 => {
                fmt::Display::fmt(&Ipv6Addr::from(self.bytes), f)?;
                if let Some(scope) = &self.scope_id {
                    write!(f, "%{}", scope)?;
                }
                Ok(())
            }
            NetworkLayerProtocol::AnyIp => f.write_str("::"),
            NetworkLayerProtocol::Unknown => Ok(()),
        }
    }
}

impl fmt::Debug for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            NetworkLayerProtocol::Unknown => f.write_str("HostAddress(null)"),
            NetworkLayerProtocol::AnyIp => f.write_str("HostAddress(any)"),
            _ => write!(f, "HostAddress({})", self),
        }
    }
}

impl Serialize for HostAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Accepts an address literal, `"any"` or the empty string (null).
impl<'de> Deserialize<'de> for HostAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        match text.trim() {
            "" => Ok(HostAddress::null()),
            "any" => Ok(SpecialAddress::Any.into()),
            other => other.parse().map_err(serde::de::Error::custom),
        }
    }
}
