//! Ancillary data (control message) decoding and encoding.
//!
//! Each platform family reports per-datagram metadata with different record
//! types, so decoding and encoding go through [`ControlMessageParser`] with
//! one implementation per family. [`Platform`] names the one compiled in.
//!
//! Fields for which no record arrives keep their sentinels.

use std::mem::size_of;
use std::ptr;

use libc::c_int;
use sockeng_addr::HostAddress;

use crate::packet::IpPacketHeader;

/// Room for pktinfo + hop limit + SCTP send/receive info with headers.
const CONTROL_WORDS: usize = 32;

/// Aligned scratch space for control records.
pub(crate) struct ControlBuffer {
    words: [u64; CONTROL_WORDS],
    len: usize,
}

impl Default for ControlBuffer {
    fn default() -> Self {
        Self {
            words: [0; CONTROL_WORDS],
            len: 0,
        }
    }
}

#[allow(unused_unsafe)]
fn cmsg_space(len: usize) -> usize {
    // SAFETY: pure arithmetic on the length.
    unsafe { libc::CMSG_SPACE(len as libc::c_uint) as usize }
}

#[allow(unused_unsafe)]
fn cmsg_len(len: usize) -> usize {
    // SAFETY: pure arithmetic on the length.
    unsafe { libc::CMSG_LEN(len as libc::c_uint) as usize }
}

impl ControlBuffer {
    pub(crate) fn capacity(&self) -> usize {
        CONTROL_WORDS * size_of::<u64>()
    }

    /// Bytes of records written so far.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.words.as_mut_ptr().cast()
    }

    /// Append one record carrying `value`. Returns false when full.
    pub(crate) fn push<T: Copy>(&mut self, level: c_int, kind: c_int, value: T) -> bool {
        let space = cmsg_space(size_of::<T>());
        if self.len + space > self.capacity() {
            return false;
        }
        // SAFETY: `len + space` fits in `words`, the start offset is a
        // multiple of the cmsg alignment because every record occupies
        // CMSG_SPACE bytes, and the payload is written unaligned.
        unsafe {
            let base = self.words.as_mut_ptr().cast::<u8>().add(self.len);
            ptr::write_bytes(base, 0, space);
            let hdr = base.cast::<libc::cmsghdr>();
            (*hdr).cmsg_len = cmsg_len(size_of::<T>()) as _;
            (*hdr).cmsg_level = level;
            (*hdr).cmsg_type = kind;
            ptr::write_unaligned(libc::CMSG_DATA(hdr).cast::<T>(), value);
        }
        self.len += space;
        true
    }
}

/// Call `f(level, type, payload)` for every record in a received message.
///
/// # Safety
///
/// `msg` must describe a control buffer filled by a successful `recvmsg`.
pub(crate) unsafe fn for_each_record(msg: &libc::msghdr, mut f: impl FnMut(c_int, c_int, &[u8])) {
    let header_len = cmsg_len(0);
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let total = (*cmsg).cmsg_len as usize;
        if total >= header_len {
            let data = std::slice::from_raw_parts(libc::CMSG_DATA(cmsg), total - header_len);
            f((*cmsg).cmsg_level, (*cmsg).cmsg_type, data);
        }
        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }
}

/// Read a `T` from the front of a record payload.
pub(crate) fn read_record<T: Copy>(data: &[u8]) -> Option<T> {
    if data.len() < size_of::<T>() {
        return None;
    }
    // SAFETY: length checked above; the read tolerates any alignment.
    Some(unsafe { ptr::read_unaligned(data.as_ptr().cast::<T>()) })
}

/// Platform-specific control record handling.
pub(crate) trait ControlMessageParser {
    /// `(level, option)` enabling IPv4 destination reporting.
    const IPV4_RECV_PACKET_INFO: Option<(c_int, c_int)>;
    /// `(level, option)` enabling IPv4 TTL reporting.
    const IPV4_RECV_HOP_LIMIT: Option<(c_int, c_int)>;

    /// Apply one received record to `header`; unknown records are ignored.
    fn parse(level: c_int, kind: c_int, data: &[u8], header: &mut IpPacketHeader);

    /// Encode the outgoing records `header` asks for.
    fn encode(header: &IpPacketHeader, ipv6: bool, out: &mut ControlBuffer);
}

fn parse_ipv6_common(level: c_int, kind: c_int, data: &[u8], header: &mut IpPacketHeader) -> bool {
    if level != libc::IPPROTO_IPV6 {
        return false;
    }
    if kind == libc::IPV6_PKTINFO {
        if let Some(info) = read_record::<libc::in6_pktinfo>(data) {
            let mut address = HostAddress::from_ipv6_bytes(info.ipi6_addr.s6_addr);
            header.ifindex = info.ipi6_ifindex as u32;
            if header.ifindex != 0 {
                address.set_scope_id(Some(&header.ifindex.to_string()));
            }
            header.destination_address = address;
        }
        return true;
    }
    if kind == libc::IPV6_HOPLIMIT && data.len() == size_of::<c_int>() {
        if let Some(hops) = read_record::<c_int>(data) {
            header.hop_limit = hops;
        }
        return true;
    }
    false
}

fn encode_ipv6_common(header: &IpPacketHeader, out: &mut ControlBuffer) {
    if header.hop_limit != -1 {
        out.push(libc::IPPROTO_IPV6, libc::IPV6_HOPLIMIT, header.hop_limit as c_int);
    }
    if header.ifindex != 0 || !header.sender_address.is_null() {
        // SAFETY: in6_pktinfo is plain data; all-zero is a valid value.
        let mut info: libc::in6_pktinfo = unsafe { std::mem::zeroed() };
        info.ipi6_ifindex = header.ifindex as _;
        if !header.sender_address.is_null() {
            info.ipi6_addr.s6_addr = header.sender_address.to_ipv6_bytes();
        }
        out.push(libc::IPPROTO_IPV6, libc::IPV6_PKTINFO, info);
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod platform {
    use super::*;
    use crate::native::sctp_sys;

    /// Linux and Android: `IP_PKTINFO`, `IP_TTL`, SCTP send/receive info.
    pub(crate) struct LinuxControlMessages;

    impl ControlMessageParser for LinuxControlMessages {
        const IPV4_RECV_PACKET_INFO: Option<(c_int, c_int)> = Some((libc::IPPROTO_IP, libc::IP_PKTINFO));
        const IPV4_RECV_HOP_LIMIT: Option<(c_int, c_int)> = Some((libc::IPPROTO_IP, libc::IP_RECVTTL));

        fn parse(level: c_int, kind: c_int, data: &[u8], header: &mut IpPacketHeader) {
            if parse_ipv6_common(level, kind, data, header) {
                return;
            }
            if level == libc::IPPROTO_IP && kind == libc::IP_PKTINFO {
                if let Some(info) = read_record::<libc::in_pktinfo>(data) {
                    header.destination_address =
                        HostAddress::from_ipv4_u32(u32::from_be(info.ipi_addr.s_addr));
                    header.ifindex = info.ipi_ifindex as u32;
                }
            } else if level == libc::IPPROTO_IP
                && kind == libc::IP_TTL
                && data.len() == size_of::<c_int>()
            {
                if let Some(ttl) = read_record::<c_int>(data) {
                    header.hop_limit = ttl;
                }
            } else if level == sctp_sys::SOL_SCTP && kind == sctp_sys::SCTP_SNDRCV {
                if let Some(info) = read_record::<sctp_sys::sctp_sndrcvinfo>(data) {
                    header.stream_number = i32::from(info.sinfo_stream);
                }
            }
        }

        fn encode(header: &IpPacketHeader, ipv6: bool, out: &mut ControlBuffer) {
            if ipv6 {
                encode_ipv6_common(header, out);
            } else {
                if header.hop_limit != -1 {
                    out.push(libc::IPPROTO_IP, libc::IP_TTL, header.hop_limit as c_int);
                }
                if header.ifindex != 0 || !header.sender_address.is_null() {
                    // SAFETY: in_pktinfo is plain data; all-zero is a valid value.
                    let mut info: libc::in_pktinfo = unsafe { std::mem::zeroed() };
                    info.ipi_ifindex = header.ifindex as _;
                    let source = header.sender_address.to_ipv4().unwrap_or(0).to_be();
                    info.ipi_spec_dst.s_addr = source;
                    info.ipi_addr.s_addr = source;
                    out.push(libc::IPPROTO_IP, libc::IP_PKTINFO, info);
                }
            }
            if header.stream_number != -1 {
                let info = sctp_sys::sctp_sndrcvinfo {
                    sinfo_stream: header.stream_number as u16,
                    ..Default::default()
                };
                out.push(sctp_sys::SOL_SCTP, sctp_sys::SCTP_SNDRCV, info);
            }
        }
    }

    pub(crate) type Platform = LinuxControlMessages;
}

#[cfg(any(target_vendor = "apple", target_os = "freebsd"))]
mod platform {
    use super::*;

    #[cfg(target_vendor = "apple")]
    const IP_RECVTTL: c_int = 24;
    #[cfg(target_os = "freebsd")]
    const IP_RECVTTL: c_int = 65;

    /// Apple and FreeBSD: destination via `IP_RECVDSTADDR`, TTL via
    /// `IP_RECVTTL` (one byte on these systems).
    pub(crate) struct BsdControlMessages;

    impl ControlMessageParser for BsdControlMessages {
        const IPV4_RECV_PACKET_INFO: Option<(c_int, c_int)> =
            Some((libc::IPPROTO_IP, libc::IP_RECVDSTADDR));
        const IPV4_RECV_HOP_LIMIT: Option<(c_int, c_int)> = Some((libc::IPPROTO_IP, IP_RECVTTL));

        fn parse(level: c_int, kind: c_int, data: &[u8], header: &mut IpPacketHeader) {
            if parse_ipv6_common(level, kind, data, header) || level != libc::IPPROTO_IP {
                return;
            }
            if kind == libc::IP_RECVDSTADDR {
                if let Some(addr) = read_record::<libc::in_addr>(data) {
                    header.destination_address = HostAddress::from_ipv4_u32(u32::from_be(addr.s_addr));
                }
            } else if kind == IP_RECVTTL {
                header.hop_limit = match data.len() {
                    1 => i32::from(data[0]),
                    _ => read_record::<c_int>(data).unwrap_or(-1),
                };
            }
        }

        fn encode(header: &IpPacketHeader, ipv6: bool, out: &mut ControlBuffer) {
            if ipv6 {
                encode_ipv6_common(header, out);
            } else if header.hop_limit != -1 {
                out.push(libc::IPPROTO_IP, libc::IP_TTL, header.hop_limit as c_int);
            }
        }
    }

    pub(crate) type Platform = BsdControlMessages;
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "freebsd"
)))]
mod platform {
    use super::*;

    /// Other POSIX systems: IPv6 records only.
    pub(crate) struct PortableControlMessages;

    impl ControlMessageParser for PortableControlMessages {
        const IPV4_RECV_PACKET_INFO: Option<(c_int, c_int)> = None;
        const IPV4_RECV_HOP_LIMIT: Option<(c_int, c_int)> = None;

        fn parse(level: c_int, kind: c_int, data: &[u8], header: &mut IpPacketHeader) {
            parse_ipv6_common(level, kind, data, header);
        }

        fn encode(header: &IpPacketHeader, ipv6: bool, out: &mut ControlBuffer) {
            if ipv6 {
                encode_ipv6_common(header, out);
            }
        }
    }

    pub(crate) type Platform = PortableControlMessages;
}

pub(crate) use platform::Platform;
