//! Native POSIX socket engine.
//!
//! [`NativeSocketEngine`] drives one OS descriptor directly:
//! - Socket creation through socket2 (TCP, UDP and one-to-one SCTP)
//! - Non-blocking connect, read and write with errno translation
//! - `recvmsg`/`sendmsg` datagram I/O with per-packet metadata
//! - Socket options, including dual-stack companions and SCTP stream counts
//! - `poll(2)` based blocking waits for the synchronous API
//!
//! The engine never resolves names and never talks to proxies; those live
//! above it in the abstract socket and the tunnel engines.

mod cmsg;
mod errors;
mod options;
mod sctp_sys;
pub(crate) mod sockaddr;


use std::io::{self, Read};
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Instant;

use libc::{c_int, c_void};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use sockeng_addr::{HostAddress, NetworkLayerProtocol, SpecialAddress};
use tracing::{debug, trace, warn};

use crate::engine::{
    wrong_state, ConnectProgress, EngineState, NetworkInterface, RawDescriptor, Readiness,
    SocketEngine, SocketOption, SocketState, SocketType, Transfer,
};
use crate::error::{Result, SocketError, SocketErrorKind as Kind};
use crate::packet::{IpPacketHeader, PacketHeaderOptions};

use cmsg::{for_each_record, ControlBuffer, ControlMessageParser, Platform};
use errors::{
    accept_error, bind_error, connect_outcome, create_error, errno_of, is_would_block,
    listen_error, multicast_error, read_error, receive_datagram_error, send_datagram_error,
    write_error, write_error_closes, ConnectErrno,
};
use options::{dual_stack_companion, get_int, is_ipv6_family, level_and_option, set_int};
use sockaddr::{adjust_address_protocol, from_storage, host_address_of, socket_addr_for};

/// First buffer size tried when sizing a pending datagram by peeking.
const PEEK_START: usize = 1500;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: c_int = 0;

/// Engine backed by a real OS socket.
#[derive(Debug, Default)]
pub struct NativeSocketEngine {
    base: EngineState,
    socket: Option<Socket>,
}

impl NativeSocketEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn invalid(&mut self, operation: &'static str) -> SocketError {
        warn!(operation, "called on an invalid socket");
        self.base
            .fail_with(Kind::UnsupportedSocketOperation, errors::INVALID_SOCKET)
    }

    /// Open the OS socket, returning the protocol actually obtained.
    fn create_socket(
        &mut self,
        socket_type: SocketType,
        protocol: NetworkLayerProtocol,
    ) -> Result<NetworkLayerProtocol> {
        let (ty, proto) = match socket_type {
            SocketType::Tcp => (Type::STREAM, Some(Protocol::TCP)),
            SocketType::Udp => (Type::DGRAM, Some(Protocol::UDP)),
            SocketType::Sctp if cfg!(any(target_os = "linux", target_os = "android")) => {
                (Type::STREAM, Some(Protocol::from(sctp_sys::IPPROTO_SCTP)))
            }
            _ => {
                return Err(self
                    .base
                    .fail_with(Kind::UnsupportedSocketOperation, errors::PROTOCOL_UNSUPPORTED))
            }
        };
        let domain = if is_ipv6_family(protocol) {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        match Socket::new(domain, ty, proto) {
            Ok(socket) => {
                self.socket = Some(socket);
                Ok(protocol)
            }
            Err(e)
                if protocol == NetworkLayerProtocol::AnyIp
                    && errno_of(&e) == libc::EAFNOSUPPORT =>
            {
                debug!("IPv6 unavailable, falling back to IPv4");
                let socket = Socket::new(Domain::IPV4, ty, proto)
                    .map_err(|e| self.base.fail(create_error(&e)))?;
                self.socket = Some(socket);
                Ok(NetworkLayerProtocol::Ipv4)
            }
            Err(e) => Err(self.base.fail(create_error(&e))),
        }
    }

    /// Read back the adopted descriptor's parameters and switch it to
    /// non-blocking mode.
    fn configure_adopted(&mut self) -> Result<()> {
        self.fetch_connection_parameters()?;
        if self.base.socket_type == SocketType::Unknown {
            return Ok(());
        }
        if !self.set_option(SocketOption::NonBlocking, 1) {
            return Err(self
                .base
                .fail_with(Kind::UnsupportedSocketOperation, errors::NON_BLOCKING_INIT_FAILED));
        }
        if self.base.socket_type == SocketType::Udp && !self.set_option(SocketOption::Broadcast, 1) {
            return Err(self
                .base
                .fail_with(Kind::UnsupportedSocketOperation, errors::BROADCASTING_INIT_FAILED));
        }
        Ok(())
    }

    /// Refresh addresses, protocol, type and stream counts from the OS.
    fn fetch_connection_parameters(&mut self) -> Result<()> {
        self.base.reset_connection();
        let Some(socket) = self.socket.as_ref() else {
            return Err(self.invalid("fetch_connection_parameters"));
        };

        match socket.local_addr() {
            Ok(local) => match local.as_socket() {
                Some(sa) => {
                    let (address, port) = host_address_of(&sa);
                    self.base.protocol = if sa.is_ipv4() {
                        NetworkLayerProtocol::Ipv4
                    } else {
                        NetworkLayerProtocol::Ipv6
                    };
                    self.base.local_address = address;
                    self.base.local_port = port;
                }
                None => self.base.protocol = NetworkLayerProtocol::Unknown,
            },
            Err(e) if errno_of(&e) == libc::EBADF || errno_of(&e) == libc::ENOTSOCK => {
                return Err(self
                    .base
                    .fail_with(Kind::UnsupportedSocketOperation, errors::INVALID_SOCKET));
            }
            Err(e) => trace!(error = %e, "getsockname failed"),
        }

        // A wildcard-bound IPv6 socket without V6ONLY accepts both families.
        if self.base.protocol == NetworkLayerProtocol::Ipv6
            && is_wildcard_v6(&self.base.local_address)
            && matches!(socket.only_v6(), Ok(false))
        {
            self.base.protocol = NetworkLayerProtocol::AnyIp;
            self.base.local_address = HostAddress::from(SpecialAddress::Any);
        }

        let connected = match socket.peer_addr().ok().and_then(|peer| peer.as_socket()) {
            Some(sa) => {
                let (address, port) = host_address_of(&sa);
                self.base.peer_address = address;
                self.base.peer_port = port;
                true
            }
            None => false,
        };
        if connected {
            self.base.inbound_stream_count = 1;
            self.base.outbound_stream_count = 1;
        }

        match socket.r#type() {
            Ok(ty) if ty == Type::STREAM => {
                if self.sctp_max_streams().is_some() {
                    self.base.socket_type = SocketType::Sctp;
                    if connected {
                        self.fetch_sctp_status()?;
                    }
                } else {
                    self.base.socket_type = SocketType::Tcp;
                }
            }
            Ok(ty) if ty == Type::DGRAM => self.base.socket_type = SocketType::Udp,
            Ok(_) => self.base.socket_type = SocketType::Unknown,
            Err(e) => trace!(error = %e, "SO_TYPE query failed"),
        }

        trace!(
            socket_type = ?self.base.socket_type,
            protocol = ?self.base.protocol,
            local = %self.base.local_address,
            local_port = self.base.local_port,
            peer = %self.base.peer_address,
            peer_port = self.base.peer_port,
            "connection parameters"
        );
        Ok(())
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn fetch_sctp_status(&mut self) -> Result<()> {
        let Some(fd) = self.fd() else {
            return Err(self.invalid("fetch_sctp_status"));
        };
        let events = sctp_sys::sctp_event_subscribe {
            sctp_data_io_event: 1,
            ..Default::default()
        };
        let status = options::set_raw(fd, sctp_sys::SOL_SCTP, sctp_sys::SCTP_EVENTS, &events)
            .and_then(|()| {
                options::get_raw::<sctp_sys::sctp_status>(
                    fd,
                    sctp_sys::SOL_SCTP,
                    sctp_sys::SCTP_STATUS,
                )
            });
        match status {
            Ok((status, _)) => {
                self.base.inbound_stream_count = i32::from(status.sstat_instrms);
                self.base.outbound_stream_count = i32::from(status.sstat_outstrms);
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "SCTP association status unavailable");
                Err(self
                    .base
                    .fail_with(Kind::UnsupportedSocketOperation, errors::INVALID_SOCKET))
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn fetch_sctp_status(&mut self) -> Result<()> {
        Err(self
            .base
            .fail_with(Kind::UnsupportedSocketOperation, errors::PROTOCOL_UNSUPPORTED))
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn sctp_max_streams(&self) -> Option<i32> {
        let fd = self.fd()?;
        let (msg, _) = options::get_raw::<sctp_sys::sctp_initmsg>(
            fd,
            sctp_sys::SOL_SCTP,
            sctp_sys::SCTP_INITMSG,
        )
        .ok()?;
        Some(i32::from(msg.sinit_num_ostreams.min(msg.sinit_max_instreams)))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn sctp_max_streams(&self) -> Option<i32> {
        None
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn set_sctp_max_streams(&mut self, value: i32) -> bool {
        let Some(fd) = self.fd() else {
            return false;
        };
        let Ok(streams) = u16::try_from(value) else {
            return false;
        };
        let result = options::get_raw::<sctp_sys::sctp_initmsg>(
            fd,
            sctp_sys::SOL_SCTP,
            sctp_sys::SCTP_INITMSG,
        )
        .and_then(|(mut msg, _)| {
            msg.sinit_num_ostreams = streams;
            msg.sinit_max_instreams = streams;
            options::set_raw(fd, sctp_sys::SOL_SCTP, sctp_sys::SCTP_INITMSG, &msg)
        });
        if let Err(e) = &result {
            debug!(error = %e, streams, "failed to set SCTP stream count");
        }
        result.is_ok()
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn set_sctp_max_streams(&mut self, _value: i32) -> bool {
        false
    }

    fn multicast_membership(
        &mut self,
        join: bool,
        group: &HostAddress,
        iface: &NetworkInterface,
    ) -> Result<()> {
        let operation = if join {
            "join_multicast_group"
        } else {
            "leave_multicast_group"
        };
        if self.socket.is_none() {
            return Err(self.invalid(operation));
        }
        if self.base.state != SocketState::Bound {
            return Err(wrong_state(&mut self.base, operation));
        }
        if self.base.socket_type != SocketType::Udp {
            return Err(self.unsupported(operation));
        }

        let result = match group.protocol() {
            NetworkLayerProtocol::Ipv6 => {
                let ip = std::net::Ipv6Addr::from(group.to_ipv6_bytes());
                self.socket.as_ref().map(|socket| {
                    if join {
                        socket.join_multicast_v6(&ip, iface.index)
                    } else {
                        socket.leave_multicast_v6(&ip, iface.index)
                    }
                })
            }
            NetworkLayerProtocol::Ipv4 => {
                if is_ipv6_family(self.base.protocol) {
                    warn!(
                        group = %group,
                        "cannot join an IPv4 group on an IPv6 socket; bind to AnyIPv4 instead"
                    );
                    return Err(self
                        .base
                        .fail_with(Kind::UnsupportedSocketOperation, errors::OPERATION_UNSUPPORTED));
                }
                let interface = if iface.is_valid() {
                    match iface.ipv4_address.as_ref().and_then(HostAddress::to_ipv4) {
                        Some(ip) => ip,
                        None => {
                            return Err(self
                                .base
                                .fail_with(Kind::Network, errors::NETWORK_UNREACHABLE))
                        }
                    }
                } else {
                    0
                };
                let ip = Ipv4Addr::from(group.to_ipv4().unwrap_or(0));
                let interface = Ipv4Addr::from(interface);
                self.socket.as_ref().map(|socket| {
                    if join {
                        socket.join_multicast_v4(&ip, &interface)
                    } else {
                        socket.leave_multicast_v4(&ip, &interface)
                    }
                })
            }
            _ => {
                return Err(self
                    .base
                    .fail_with(Kind::UnsupportedSocketOperation, errors::PROTOCOL_UNSUPPORTED))
            }
        };

        match result {
            Some(Ok(())) => {
                debug!(group = %group, iface = iface.index, join, "multicast membership changed");
                Ok(())
            }
            Some(Err(e)) => Err(self.base.fail(multicast_error(errno_of(&e)))),
            None => Err(self.invalid(operation)),
        }
    }
}

fn is_wildcard_v6(address: &HostAddress) -> bool {
    let bytes = address.to_ipv6_bytes();
    let mapped_any = bytes[..10].iter().all(|b| *b == 0)
        && bytes[10] == 0xff
        && bytes[11] == 0xff
        && bytes[12..].iter().all(|b| *b == 0);
    bytes == [0; 16] || mapped_any
}

fn last_errno() -> i32 {
    errno_of(&io::Error::last_os_error())
}

/// Size the datagram at the head of the queue by peeking with growing
/// buffers until the kernel stops truncating.
#[cfg_attr(any(target_os = "linux", target_os = "android"), allow(dead_code))]
fn peek_size_by_growth(fd: RawFd) -> Option<usize> {
    let mut size = PEEK_START;
    loop {
        let mut buf = vec![0u8; size];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast::<c_void>(),
            iov_len: buf.len(),
        };
        // SAFETY: msghdr is plain data; all-zero is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        // SAFETY: `msg` points at `iov`, which points at `buf`; both outlive the call.
        let rc = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_PEEK) };
        if rc == -1 {
            if last_errno() == libc::EINTR {
                continue;
            }
            return None;
        }
        if msg.msg_flags & libc::MSG_TRUNC == 0 {
            return Some(rc as usize);
        }
        size = size.checked_mul(16)?;
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peek_datagram_size(fd: RawFd) -> Option<usize> {
    let mut byte = 0u8;
    loop {
        // SAFETY: one writable byte; MSG_TRUNC makes the kernel report the
        // real length without copying more.
        let rc = unsafe {
            libc::recv(
                fd,
                (&mut byte as *mut u8).cast::<c_void>(),
                1,
                libc::MSG_PEEK | libc::MSG_TRUNC,
            )
        };
        if rc == -1 {
            if last_errno() == libc::EINTR {
                continue;
            }
            return None;
        }
        return Some(rc as usize);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn peek_datagram_size(fd: RawFd) -> Option<usize> {
    peek_size_by_growth(fd)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn reuse_option(_socket_type: SocketType, name: c_int) -> c_int {
    name
}

/// BSD systems need SO_REUSEPORT for several UDP sockets on one port.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn reuse_option(socket_type: SocketType, name: c_int) -> c_int {
    if socket_type == SocketType::Udp && name == libc::SO_REUSEADDR {
        libc::SO_REUSEPORT
    } else {
        name
    }
}

fn poll_timeout(deadline: Option<Instant>) -> c_int {
    match deadline {
        None => -1,
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = remaining.as_nanos().div_ceil(1_000_000);
            millis.min(c_int::MAX as u128) as c_int
        }
    }
}

impl SocketEngine for NativeSocketEngine {
    fn base(&self) -> &EngineState {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EngineState {
        &mut self.base
    }

    fn initialize(&mut self, socket_type: SocketType, protocol: NetworkLayerProtocol) -> Result<()> {
        if self.is_valid() {
            self.close();
        }
        self.base.clear_error();

        let actual = self.create_socket(socket_type, protocol)?;
        self.base.socket_type = socket_type;
        self.base.protocol = actual;

        if socket_type == SocketType::Udp {
            if !self.set_option(SocketOption::Broadcast, 1) {
                self.close();
                return Err(self
                    .base
                    .fail_with(Kind::UnsupportedSocketOperation, errors::BROADCASTING_INIT_FAILED));
            }
            if !self.set_option(SocketOption::ReceivePacketInformation, 1) {
                debug!("packet information not available on this socket");
            }
            if !self.set_option(SocketOption::ReceiveHopLimit, 1) {
                debug!("hop limit reporting not available on this socket");
            }
        }

        if !self.set_option(SocketOption::NonBlocking, 1) {
            self.close();
            return Err(self
                .base
                .fail_with(Kind::UnsupportedSocketOperation, errors::NON_BLOCKING_INIT_FAILED));
        }

        if socket_type == SocketType::Tcp && !self.set_option(SocketOption::ReceiveOutOfBandData, 1) {
            warn!("failed to enable inline out-of-band data");
        }

        debug!(
            fd = self.fd().unwrap_or(-1),
            socket_type = ?socket_type,
            protocol = ?actual,
            "socket initialized"
        );
        Ok(())
    }

    fn initialize_from_descriptor(
        &mut self,
        descriptor: RawDescriptor,
        state: SocketState,
    ) -> Result<()> {
        if self.is_valid() {
            self.close();
        }
        self.base.clear_error();

        // SAFETY: the caller hands over ownership of an open descriptor.
        self.socket = Some(unsafe { Socket::from_raw_fd(descriptor) });

        if let Err(e) = self.configure_adopted() {
            // The caller still owns the descriptor on failure.
            if let Some(socket) = self.socket.take() {
                let _ = socket.into_raw_fd();
            }
            return Err(e);
        }

        self.base.state = state;
        debug!(fd = descriptor, state = ?state, "adopted descriptor");
        Ok(())
    }

    fn descriptor(&self) -> Option<RawDescriptor> {
        self.fd()
    }

    fn is_valid(&self) -> bool {
        self.socket.is_some()
    }

    fn connect_to_host(&mut self, address: &HostAddress, port: u16) -> Result<ConnectProgress> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(self.invalid("connect_to_host"));
        };
        if !matches!(
            self.base.state,
            SocketState::Unconnected | SocketState::Bound | SocketState::Connecting
        ) {
            return Err(wrong_state(&mut self.base, "connect_to_host"));
        }

        self.base.peer_address = address.clone();
        self.base.peer_port = port;
        let target = socket_addr_for(&adjust_address_protocol(address, self.base.protocol), port);

        if let Err(e) = socket.connect(&SockAddr::from(target)) {
            match connect_outcome(&e) {
                ConnectErrno::Connected => {}
                ConnectErrno::InProgress => {
                    self.base.state = SocketState::Connecting;
                    trace!(peer = %target, "connect in progress");
                    return Ok(ConnectProgress::InProgress);
                }
                ConnectErrno::Failed(err, state) => {
                    debug!(peer = %target, error = %err, "connect failed");
                    self.base.state = state;
                    return Err(self.base.fail(err));
                }
            }
        }

        self.base.state = SocketState::Connected;
        self.fetch_connection_parameters()?;
        self.base.clear_error();
        debug!(peer = %target, local_port = self.base.local_port, "connected");
        Ok(ConnectProgress::Connected)
    }

    fn connection_notification(&mut self) -> SocketState {
        if self.base.state != SocketState::Connecting {
            return self.base.state;
        }
        // The pending error tells refused connects apart without another syscall.
        if let Some(Ok(Some(e))) = self.socket.as_ref().map(Socket::take_error) {
            if let ConnectErrno::Failed(err, state) = connect_outcome(&e) {
                debug!(error = %err, "asynchronous connect failed");
                self.base.state = state;
                self.base.fail(err);
                return state;
            }
        }
        let peer = self.base.peer_address.clone();
        let port = self.base.peer_port;
        let _ = self.connect_to_host(&peer, port);
        self.base.state
    }

    fn bind(&mut self, address: &HostAddress, port: u16) -> Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(self.invalid("bind"));
        };
        if self.base.state != SocketState::Unconnected {
            return Err(wrong_state(&mut self.base, "bind"));
        }

        let target = socket_addr_for(&adjust_address_protocol(address, self.base.protocol), port);
        if target.is_ipv6() {
            let v6_only = address.protocol() == NetworkLayerProtocol::Ipv6;
            if let Err(e) = socket.set_only_v6(v6_only) {
                trace!(error = %e, v6_only, "IPV6_V6ONLY not applied");
            }
        }

        let mut result = socket.bind(&SockAddr::from(target));
        if let Err(e) = &result {
            if errno_of(e) == libc::EAFNOSUPPORT && address.protocol() == NetworkLayerProtocol::AnyIp {
                let fallback = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
                result = socket.bind(&SockAddr::from(fallback));
            }
        }
        if let Err(e) = result {
            let err = bind_error(&e);
            debug!(address = %target, error = %err, "bind failed");
            return Err(self.base.fail(err));
        }

        self.base.state = SocketState::Bound;
        self.fetch_connection_parameters()?;
        self.base.clear_error();
        debug!(
            local = %self.base.local_address,
            port = self.base.local_port,
            "socket bound"
        );
        Ok(())
    }

    fn listen(&mut self, backlog: i32) -> Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(self.invalid("listen"));
        };
        if self.base.state != SocketState::Bound {
            return Err(wrong_state(&mut self.base, "listen"));
        }
        if !matches!(self.base.socket_type, SocketType::Tcp | SocketType::Sctp) {
            return Err(self.unsupported("listen"));
        }
        if let Err(e) = socket.listen(backlog) {
            return Err(self.base.fail(listen_error(&e)));
        }
        self.base.state = SocketState::Listening;
        self.base.clear_error();
        debug!(port = self.base.local_port, backlog, "listening");
        Ok(())
    }

    fn accept(&mut self) -> Result<Option<RawDescriptor>> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(self.invalid("accept"));
        };
        if self.base.state != SocketState::Listening {
            return Err(wrong_state(&mut self.base, "accept"));
        }
        match socket.accept() {
            Ok((accepted, peer)) => {
                trace!(peer = ?peer.as_socket(), "accepted connection");
                Ok(Some(accepted.into_raw_fd()))
            }
            Err(e) => match accept_error(&e) {
                None => Ok(None),
                Some(err) => Err(self.base.fail(err)),
            },
        }
    }

    fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            debug!(fd = socket.as_raw_fd(), "closing socket");
        }
        self.base.state = SocketState::Unconnected;
        self.base.reset_connection();
        self.base.read_notification = false;
        self.base.write_notification = false;
        self.base.exception_notification = false;
    }

    fn bytes_available(&self) -> usize {
        let Some(fd) = self.fd() else {
            return 0;
        };
        let mut available: c_int = 0;
        // SAFETY: FIONREAD writes one int into `available`.
        let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) };
        if rc == -1 {
            return 0;
        }
        usize::try_from(available).unwrap_or(0)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(self.invalid("read"));
        };
        if !matches!(self.base.state, SocketState::Connected | SocketState::Bound) {
            return Err(wrong_state(&mut self.base, "read"));
        }

        let mut reader = socket;
        let outcome = loop {
            match reader.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match outcome {
            Ok(0) if !buf.is_empty()
                && matches!(self.base.socket_type, SocketType::Tcp | SocketType::Sctp) =>
            {
                debug!("remote host closed the connection");
                self.close();
                Err(self
                    .base
                    .fail_with(Kind::RemoteHostClosed, errors::REMOTE_HOST_CLOSED))
            }
            Ok(n) => {
                trace!(bytes = n, "read");
                Ok(Transfer::Done(n))
            }
            Err(e) if is_would_block(errno_of(&e)) => Ok(Transfer::WouldBlock),
            Err(e) => {
                let err = read_error(&e);
                debug!(error = %err, "read failed");
                self.close();
                Err(self.base.fail(err))
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<Transfer> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(self.invalid("write"));
        };
        if self.base.state != SocketState::Connected {
            return Err(wrong_state(&mut self.base, "write"));
        }

        let outcome = loop {
            match socket.send(data) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match outcome {
            Ok(n) => {
                trace!(bytes = n, "wrote");
                Ok(Transfer::Done(n))
            }
            Err(e) => match write_error(&e) {
                None => Ok(Transfer::WouldBlock),
                Some(err) => {
                    debug!(error = %err, "write failed");
                    if write_error_closes(&err) {
                        self.close();
                    }
                    Err(self.base.fail(err))
                }
            },
        }
    }

    fn read_datagram(
        &mut self,
        buf: &mut [u8],
        options: PacketHeaderOptions,
    ) -> Result<Transfer<(usize, IpPacketHeader)>> {
        let Some(fd) = self.fd() else {
            return Err(self.invalid("read_datagram"));
        };
        if !matches!(self.base.state, SocketState::Connected | SocketState::Bound) {
            return Err(wrong_state(&mut self.base, "read_datagram"));
        }

        // SAFETY: sockaddr_storage and msghdr are plain data; zero is valid.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        let mut scratch = 0u8;
        let mut iov = if buf.is_empty() {
            libc::iovec {
                iov_base: (&mut scratch as *mut u8).cast::<c_void>(),
                iov_len: 1,
            }
        } else {
            libc::iovec {
                iov_base: buf.as_mut_ptr().cast::<c_void>(),
                iov_len: buf.len(),
            }
        };
        let mut control = ControlBuffer::default();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if options.contains(PacketHeaderOptions::SENDER) {
            msg.msg_name = (&mut storage as *mut libc::sockaddr_storage).cast::<c_void>();
            msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        }
        if options.wants_control_data() {
            msg.msg_control = control.as_mut_ptr();
            msg.msg_controllen = control.capacity() as _;
        }

        let received = loop {
            // SAFETY: every pointer in `msg` refers to a local that outlives the call.
            let rc = unsafe { libc::recvmsg(fd, &mut msg, 0) };
            if rc == -1 {
                let errno = last_errno();
                if errno == libc::EINTR {
                    continue;
                }
                break Err(errno);
            }
            break Ok(rc as usize);
        };

        let len = match received {
            Ok(len) => len,
            Err(errno) if is_would_block(errno) => return Ok(Transfer::WouldBlock),
            Err(errno) => {
                let err = receive_datagram_error(errno);
                debug!(error = %err, "receive failed");
                return Err(self.base.fail(err));
            }
        };

        let mut header = IpPacketHeader::default();
        if options != PacketHeaderOptions::NONE {
            if options.contains(PacketHeaderOptions::SENDER) {
                if let Some(sender) = from_storage(&storage, msg.msg_namelen) {
                    let (address, port) = host_address_of(&sender);
                    header.sender_address = address;
                    header.sender_port = port;
                }
            }
            header.destination_port = self.base.local_port;
            header.end_of_record = msg.msg_flags & libc::MSG_EOR != 0;
            if options.wants_control_data() {
                // SAFETY: `msg` was just filled by a successful recvmsg.
                unsafe {
                    for_each_record(&msg, |level, kind, data| {
                        Platform::parse(level, kind, data, &mut header)
                    });
                }
            }
        }

        let len = if buf.is_empty() { 0 } else { len };
        trace!(bytes = len, sender = %header.sender_address, "datagram received");
        Ok(Transfer::Done((len, header)))
    }

    fn write_datagram(&mut self, data: &[u8], header: &IpPacketHeader) -> Result<Transfer> {
        let Some(fd) = self.fd() else {
            return Err(self.invalid("write_datagram"));
        };

        let destination = (header.destination_port != 0).then(|| {
            let target = adjust_address_protocol(&header.destination_address, self.base.protocol);
            socket_addr_for(&target, header.destination_port)
        });
        let ipv6 = destination.map_or(is_ipv6_family(self.base.protocol), |sa| sa.is_ipv6());
        let destination = destination.map(SockAddr::from);

        let mut iov = libc::iovec {
            iov_base: data.as_ptr() as *mut c_void,
            iov_len: data.len(),
        };
        // SAFETY: msghdr is plain data; all-zero is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if let Some(dest) = &destination {
            msg.msg_name = dest.as_ptr() as *mut c_void;
            msg.msg_namelen = dest.len();
        }
        let mut control = ControlBuffer::default();
        Platform::encode(header, ipv6, &mut control);
        if control.len() > 0 {
            msg.msg_control = control.as_mut_ptr();
            msg.msg_controllen = control.len() as _;
        }

        let sent = loop {
            // SAFETY: `msg` refers to `iov`, `destination` and `control`, all live here.
            let rc = unsafe { libc::sendmsg(fd, &msg, SEND_FLAGS) };
            if rc == -1 {
                let errno = last_errno();
                if errno == libc::EINTR {
                    continue;
                }
                break Err(errno);
            }
            break Ok(rc as usize);
        };

        match sent {
            Ok(n) => {
                trace!(bytes = n, port = header.destination_port, "datagram sent");
                Ok(Transfer::Done(n))
            }
            Err(errno) if is_would_block(errno) => Ok(Transfer::WouldBlock),
            Err(errno) => {
                let err = send_datagram_error(errno);
                debug!(error = %err, "send failed");
                Err(self.base.fail(err))
            }
        }
    }

    fn has_pending_datagrams(&self) -> bool {
        let Some(fd) = self.fd() else {
            return false;
        };
        let mut byte = 0u8;
        loop {
            // SAFETY: one writable byte.
            let rc = unsafe {
                libc::recv(fd, (&mut byte as *mut u8).cast::<c_void>(), 1, libc::MSG_PEEK)
            };
            if rc == -1 {
                let errno = last_errno();
                if errno == libc::EINTR {
                    continue;
                }
                // An oversized datagram is still a pending one.
                return errno == libc::EMSGSIZE;
            }
            return true;
        }
    }

    fn pending_datagram_size(&self) -> Option<usize> {
        peek_datagram_size(self.fd()?)
    }

    fn join_multicast_group(&mut self, group: &HostAddress, iface: &NetworkInterface) -> Result<()> {
        self.multicast_membership(true, group, iface)
    }

    fn leave_multicast_group(&mut self, group: &HostAddress, iface: &NetworkInterface) -> Result<()> {
        self.multicast_membership(false, group, iface)
    }

    fn multicast_interface(&self) -> Option<NetworkInterface> {
        let socket = self.socket.as_ref()?;
        if is_ipv6_family(self.base.protocol) {
            let index = socket.multicast_if_v6().ok()?;
            return Some(NetworkInterface::from_index(index));
        }
        let address = socket.multicast_if_v4().ok()?;
        if address.is_unspecified() {
            return Some(NetworkInterface::any());
        }
        Some(NetworkInterface {
            index: 0,
            ipv4_address: Some(HostAddress::from(address)),
        })
    }

    fn set_multicast_interface(&mut self, iface: &NetworkInterface) -> Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(self.invalid("set_multicast_interface"));
        };
        let result = if is_ipv6_family(self.base.protocol) {
            socket.set_multicast_if_v6(iface.index)
        } else {
            let address = iface
                .ipv4_address
                .as_ref()
                .and_then(HostAddress::to_ipv4)
                .unwrap_or(0);
            socket.set_multicast_if_v4(&Ipv4Addr::from(address))
        };
        result.map_err(|e| self.base.fail(multicast_error(errno_of(&e))))
    }

    fn option(&self, option: SocketOption) -> Option<i32> {
        let fd = self.fd()?;
        match option {
            SocketOption::NonBlocking | SocketOption::BindExclusively | SocketOption::Broadcast => {
                None
            }
            SocketOption::MaxStreams => self.sctp_max_streams(),
            _ => {
                let (level, name) = level_and_option(option, self.base.protocol)?;
                let name = reuse_option(self.base.socket_type, name);
                get_int(fd, level, name).ok()
            }
        }
    }

    fn set_option(&mut self, option: SocketOption, value: i32) -> bool {
        let Some(socket) = self.socket.as_ref() else {
            return false;
        };
        let fd = socket.as_raw_fd();
        match option {
            SocketOption::NonBlocking => return socket.set_nonblocking(value != 0).is_ok(),
            SocketOption::BindExclusively => return true,
            SocketOption::MaxStreams => return self.set_sctp_max_streams(value),
            _ => {}
        }

        let Some((level, name)) = level_and_option(option, self.base.protocol) else {
            return false;
        };
        let name = reuse_option(self.base.socket_type, name);
        let result = set_int(fd, level, name, value);
        if let Err(e) = &result {
            debug!(?option, value, error = %e, "setsockopt failed");
        }

        if self.base.protocol == NetworkLayerProtocol::AnyIp {
            if let Some((level, name)) = dual_stack_companion(option) {
                if let Err(e) = set_int(fd, level, name, value) {
                    trace!(?option, error = %e, "IPv4 companion option not applied");
                }
            }
        }
        result.is_ok()
    }

    fn wait_for_read_or_write(
        &mut self,
        check_read: bool,
        check_write: bool,
        deadline: Option<Instant>,
    ) -> Result<Readiness> {
        let Some(fd) = self.fd() else {
            return Err(self.invalid("wait_for_read_or_write"));
        };
        let mut pfd = libc::pollfd {
            fd,
            events: 0,
            revents: 0,
        };
        if check_read {
            pfd.events |= libc::POLLIN;
        }
        if check_write {
            pfd.events |= libc::POLLOUT;
        }

        let ready = loop {
            // SAFETY: one pollfd, valid for the call.
            let rc = unsafe { libc::poll(&mut pfd, 1, poll_timeout(deadline)) };
            if rc == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(self.base.fail_with(Kind::Network, err.to_string()));
            }
            break rc;
        };

        if ready == 0 {
            self.base.fail_with(Kind::SocketTimeout, errors::TIME_OUT);
            return Ok(Readiness {
                timed_out: true,
                ..Readiness::default()
            });
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(self.invalid("wait_for_read_or_write"));
        }
        Ok(Readiness {
            readable: pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
            writable: pfd.revents & (libc::POLLOUT | libc::POLLERR) != 0,
            timed_out: false,
        })
    }
}
