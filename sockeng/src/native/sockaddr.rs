//! Conversions between [`HostAddress`] and OS socket addresses.

use std::ffi::{CStr, CString};
use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use sockeng_addr::{HostAddress, NetworkLayerProtocol};

/// Build the OS address for `address:port`.
///
/// IPv6 and AnyIP addresses produce an IPv6 sockaddr, everything else IPv4.
/// A textual scope id is resolved through `if_nametoindex`.
pub(crate) fn socket_addr_for(address: &HostAddress, port: u16) -> SocketAddr {
    match address.protocol() {
        NetworkLayerProtocol::Ipv6 | NetworkLayerProtocol::AnyIp => {
            let ip = Ipv6Addr::from(address.to_ipv6_bytes());
            let scope = address.scope_id().map_or(0, scope_index);
            SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope))
        }
        _ => {
            let ip = Ipv4Addr::from(address.to_ipv4().unwrap_or(0));
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        }
    }
}

/// Split an OS address into a [`HostAddress`] and port.
pub(crate) fn host_address_of(addr: &SocketAddr) -> (HostAddress, u16) {
    match addr {
        SocketAddr::V4(v4) => (HostAddress::from(*v4.ip()), v4.port()),
        SocketAddr::V6(v6) => {
            let mut address = HostAddress::from_ipv6_bytes(v6.ip().octets());
            if v6.scope_id() != 0 {
                address.set_scope_id(Some(&scope_name(v6.scope_id())));
            }
            (address, v6.port())
        }
    }
}

/// Decode the sender address a `recvmsg` call wrote into `storage`.
pub(crate) fn from_storage(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Option<SocketAddr> {
    let len = len as usize;
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET if len >= size_of::<libc::sockaddr_in>() => {
            // SAFETY: the family and length say this is a sockaddr_in, and
            // sockaddr_storage is aligned for every sockaddr type.
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len >= size_of::<libc::sockaddr_in6>() => {
            // SAFETY: as above, for sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Interface index for a scope id, numeric or by name. Unknown names give 0.
pub(crate) fn scope_index(scope: &str) -> u32 {
    if let Ok(index) = scope.parse::<u32>() {
        return index;
    }
    let Ok(name) = CString::new(scope) else {
        return 0;
    };
    // SAFETY: `name` is a valid NUL-terminated string for the whole call.
    unsafe { libc::if_nametoindex(name.as_ptr()) }
}

/// Interface name for an index, falling back to the number itself.
pub(crate) fn scope_name(index: u32) -> String {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    // SAFETY: `buf` holds IF_NAMESIZE bytes as the call requires.
    let ptr = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if ptr.is_null() {
        return index.to_string();
    }
    // SAFETY: on success the buffer holds a NUL-terminated name.
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Coerce `address` to the family of a socket speaking `socket_protocol`.
///
/// IPv4 targets on IPv6 sockets become v4-mapped; v4-mapped targets on IPv4
/// sockets become plain IPv4. Anything else is returned unchanged.
pub(crate) fn adjust_address_protocol(
    address: &HostAddress,
    socket_protocol: NetworkLayerProtocol,
) -> HostAddress {
    let target = match socket_protocol {
        NetworkLayerProtocol::Unknown => return address.clone(),
        NetworkLayerProtocol::AnyIp => NetworkLayerProtocol::Ipv6,
        other => other,
    };
    match (target, address.protocol()) {
        (NetworkLayerProtocol::Ipv6, NetworkLayerProtocol::Ipv4) => {
            HostAddress::from_ipv6_bytes(address.to_ipv6_bytes())
        }
        (NetworkLayerProtocol::Ipv4, NetworkLayerProtocol::Ipv6) => match address.to_ipv4() {
            Some(ip4) => HostAddress::from_ipv4_u32(ip4),
            None => address.clone(),
        },
        _ => address.clone(),
    }
}
