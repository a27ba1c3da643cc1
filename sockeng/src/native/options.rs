//! Translation of [`SocketOption`] to OS `(level, option)` pairs and raw
//! `getsockopt`/`setsockopt` helpers.

use std::io;
use std::mem::size_of;
use std::os::fd::RawFd;

use libc::{c_int, c_void, socklen_t};
use sockeng_addr::NetworkLayerProtocol;

use super::cmsg::{ControlMessageParser, Platform};
use crate::engine::SocketOption;

/// Whether the socket speaks IPv6 (including dual-stack).
pub(super) fn is_ipv6_family(protocol: NetworkLayerProtocol) -> bool {
    matches!(
        protocol,
        NetworkLayerProtocol::Ipv6 | NetworkLayerProtocol::AnyIp
    )
}

/// OS `(level, option)` for options handled by plain get/setsockopt.
///
/// Returns `None` for options with special handling (non-blocking,
/// exclusive bind, SCTP stream count) and for options the platform lacks
/// for this address family.
pub(super) fn level_and_option(
    option: SocketOption,
    protocol: NetworkLayerProtocol,
) -> Option<(c_int, c_int)> {
    let ipv6 = is_ipv6_family(protocol);
    match option {
        SocketOption::NonBlocking | SocketOption::BindExclusively | SocketOption::MaxStreams => None,
        SocketOption::Broadcast => Some((libc::SOL_SOCKET, libc::SO_BROADCAST)),
        SocketOption::ReceiveBufferSize => Some((libc::SOL_SOCKET, libc::SO_RCVBUF)),
        SocketOption::SendBufferSize => Some((libc::SOL_SOCKET, libc::SO_SNDBUF)),
        SocketOption::AddressReusable => Some((libc::SOL_SOCKET, libc::SO_REUSEADDR)),
        SocketOption::ReceiveOutOfBandData => Some((libc::SOL_SOCKET, libc::SO_OOBINLINE)),
        SocketOption::LowDelay => Some((libc::IPPROTO_TCP, libc::TCP_NODELAY)),
        SocketOption::KeepAlive => Some((libc::SOL_SOCKET, libc::SO_KEEPALIVE)),
        SocketOption::MulticastTtl if ipv6 => {
            Some((libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS))
        }
        SocketOption::MulticastTtl => Some((libc::IPPROTO_IP, libc::IP_MULTICAST_TTL)),
        SocketOption::MulticastLoopback if ipv6 => {
            Some((libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP))
        }
        SocketOption::MulticastLoopback => Some((libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP)),
        SocketOption::TypeOfService => (protocol == NetworkLayerProtocol::Ipv4)
            .then_some((libc::IPPROTO_IP, libc::IP_TOS)),
        SocketOption::ReceivePacketInformation if ipv6 => {
            Some((libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO))
        }
        SocketOption::ReceivePacketInformation => Platform::IPV4_RECV_PACKET_INFO,
        SocketOption::ReceiveHopLimit if ipv6 => {
            Some((libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT))
        }
        SocketOption::ReceiveHopLimit => Platform::IPV4_RECV_HOP_LIMIT,
        SocketOption::PathMtu => path_mtu_option(ipv6),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn path_mtu_option(ipv6: bool) -> Option<(c_int, c_int)> {
    if ipv6 {
        Some((libc::IPPROTO_IPV6, libc::IPV6_MTU))
    } else {
        Some((libc::IPPROTO_IP, libc::IP_MTU))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn path_mtu_option(_ipv6: bool) -> Option<(c_int, c_int)> {
    None
}

/// IPv4 companion of an IPv6 option, set alongside it on dual-stack sockets.
pub(super) fn dual_stack_companion(option: SocketOption) -> Option<(c_int, c_int)> {
    match option {
        SocketOption::ReceivePacketInformation => Platform::IPV4_RECV_PACKET_INFO,
        SocketOption::ReceiveHopLimit => Platform::IPV4_RECV_HOP_LIMIT,
        SocketOption::MulticastTtl => Some((libc::IPPROTO_IP, libc::IP_MULTICAST_TTL)),
        SocketOption::MulticastLoopback => Some((libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP)),
        _ => None,
    }
}

/// `getsockopt` into a `T`, returning the value and the length the OS wrote.
pub(super) fn get_raw<T: Copy + Default>(
    fd: RawFd,
    level: c_int,
    name: c_int,
) -> io::Result<(T, usize)> {
    let mut value = T::default();
    let mut len = size_of::<T>() as socklen_t;
    // SAFETY: `value` is a valid writable `T` and `len` its size.
    let rc = unsafe {
        libc::getsockopt(fd, level, name, (&mut value as *mut T).cast::<c_void>(), &mut len)
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok((value, len as usize))
}

pub(super) fn set_raw<T: Copy>(fd: RawFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    // SAFETY: `value` points to a valid `T` of the stated size.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (value as *const T).cast::<c_void>(),
            size_of::<T>() as socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Integer option read. Single-byte answers (IPv4 multicast options on
/// some systems) are widened.
pub(super) fn get_int(fd: RawFd, level: c_int, name: c_int) -> io::Result<i32> {
    let (value, len) = get_raw::<c_int>(fd, level, name)?;
    if len == 1 {
        return Ok(i32::from(value.to_ne_bytes()[0]));
    }
    Ok(value)
}

pub(super) fn set_int(fd: RawFd, level: c_int, name: c_int, value: i32) -> io::Result<()> {
    set_raw(fd, level, name, &(value as c_int))
}
