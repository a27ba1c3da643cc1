//! Socket engine contract.
//!
//! A [`SocketEngine`] is the OS-facing half of a socket. It owns one
//! descriptor (or one tunnelled connection), performs non-blocking I/O and
//! records the last error. Engines never block except in the explicit
//! `wait_for_*` calls.
//!
//! Shared bookkeeping lives in [`EngineState`]; implementations expose it via
//! `base()`/`base_mut()` and get the accessors and notification flags for free.
//!
//! Operations an engine does not support fall back to default methods that
//! record [`SocketErrorKind::UnsupportedSocketOperation`].

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sockeng_addr::{HostAddress, NetworkLayerProtocol};
use tracing::warn;

use crate::error::{Result, SocketError, SocketErrorKind};
use crate::packet::{IpPacketHeader, PacketHeaderOptions};

/// OS socket handle type.
#[cfg(unix)]
pub type RawDescriptor = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawDescriptor = std::os::windows::io::RawSocket;

/// Transport protocol of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketType {
    Tcp,
    Udp,
    Sctp,
    #[default]
    Unknown,
}

/// Connection state shared by engines and the socket layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SocketState {
    #[default]
    Unconnected,
    HostLookup,
    Connecting,
    Connected,
    Bound,
    Listening,
    Closing,
}

/// Options understood by engines.
///
/// Engines report unsupported options through `option() == None` and
/// `set_option() == false` rather than failing hard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    NonBlocking,
    Broadcast,
    ReceiveBufferSize,
    SendBufferSize,
    AddressReusable,
    BindExclusively,
    ReceiveOutOfBandData,
    LowDelay,
    KeepAlive,
    MulticastTtl,
    MulticastLoopback,
    TypeOfService,
    ReceivePacketInformation,
    ReceiveHopLimit,
    MaxStreams,
    PathMtu,
}

/// Outcome of a non-blocking transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer<T = usize> {
    Done(T),
    WouldBlock,
}

impl<T> Transfer<T> {
    pub fn is_would_block(&self) -> bool {
        matches!(self, Transfer::WouldBlock)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Transfer::Done(value) => Some(value),
            Transfer::WouldBlock => None,
        }
    }
}

/// Result of a connect attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Connected,
    InProgress,
}

/// Readiness the event source should watch for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
    pub exception: bool,
}

/// Outcome of a blocking readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub timed_out: bool,
}

/// Interface selector for multicast operations.
///
/// Index `0` means "let the OS choose". IPv4 membership needs an address of
/// the interface because the IPv4 socket API selects interfaces by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    pub index: u32,
    pub ipv4_address: Option<HostAddress>,
}

impl NetworkInterface {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn from_index(index: u32) -> Self {
        Self {
            index,
            ipv4_address: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.index != 0 || self.ipv4_address.is_some()
    }
}

/// Bookkeeping common to every engine.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub socket_type: SocketType,
    pub protocol: NetworkLayerProtocol,
    pub state: SocketState,
    pub error: Option<SocketError>,
    pub local_address: HostAddress,
    pub local_port: u16,
    pub peer_address: HostAddress,
    pub peer_port: u16,
    pub inbound_stream_count: i32,
    pub outbound_stream_count: i32,
    pub read_notification: bool,
    pub write_notification: bool,
    pub exception_notification: bool,
}

impl EngineState {
    /// Record `err` as the sticky error and hand it back for returning.
    pub fn fail(&mut self, err: SocketError) -> SocketError {
        self.error = Some(err.clone());
        err
    }

    pub fn fail_with(&mut self, kind: SocketErrorKind, message: impl Into<String>) -> SocketError {
        self.fail(SocketError::new(kind, message))
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Forget addresses, ports and stream counts.
    pub fn reset_connection(&mut self) {
        self.local_address.clear();
        self.local_port = 0;
        self.peer_address.clear();
        self.peer_port = 0;
        self.inbound_stream_count = 0;
        self.outbound_stream_count = 0;
    }
}

/// The OS-facing socket contract.
pub trait SocketEngine: Send + fmt::Debug {
    fn base(&self) -> &EngineState;
    fn base_mut(&mut self) -> &mut EngineState;

    /// Create a fresh socket, closing any previous one.
    fn initialize(&mut self, socket_type: SocketType, protocol: NetworkLayerProtocol) -> Result<()>;

    /// Adopt an existing descriptor and assume `state`.
    fn initialize_from_descriptor(
        &mut self,
        descriptor: RawDescriptor,
        state: SocketState,
    ) -> Result<()>;

    fn descriptor(&self) -> Option<RawDescriptor>;

    fn is_valid(&self) -> bool;

    fn connect_to_host(&mut self, address: &HostAddress, port: u16) -> Result<ConnectProgress>;

    /// Connect by name, for engines whose transport resolves names itself.
    fn connect_to_host_by_name(&mut self, name: &str, port: u16) -> Result<ConnectProgress> {
        let _ = (name, port);
        Err(self.unsupported("connect_to_host_by_name"))
    }

    /// Re-test a pending connect after a readiness notification.
    ///
    /// Returns the state the engine is in afterwards.
    fn connection_notification(&mut self) -> SocketState {
        if self.base().state == SocketState::Connecting {
            let peer = self.base().peer_address.clone();
            let port = self.base().peer_port;
            let _ = self.connect_to_host(&peer, port);
        }
        self.base().state
    }

    fn bind(&mut self, address: &HostAddress, port: u16) -> Result<()>;

    fn listen(&mut self, backlog: i32) -> Result<()> {
        let _ = backlog;
        Err(self.unsupported("listen"))
    }

    /// Accept one pending connection; `None` when the queue is empty.
    fn accept(&mut self) -> Result<Option<RawDescriptor>> {
        Err(self.unsupported("accept"))
    }

    fn close(&mut self);

    fn bytes_available(&self) -> usize;

    /// Bytes buffered inside the engine itself, not yet handed to the OS.
    fn bytes_to_write(&self) -> usize {
        0
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer>;

    fn write(&mut self, data: &[u8]) -> Result<Transfer>;

    fn read_datagram(
        &mut self,
        buf: &mut [u8],
        options: PacketHeaderOptions,
    ) -> Result<Transfer<(usize, IpPacketHeader)>> {
        let _ = (buf, options);
        Err(self.unsupported("read_datagram"))
    }

    fn write_datagram(&mut self, data: &[u8], header: &IpPacketHeader) -> Result<Transfer> {
        let _ = (data, header);
        Err(self.unsupported("write_datagram"))
    }

    fn has_pending_datagrams(&self) -> bool {
        false
    }

    fn pending_datagram_size(&self) -> Option<usize> {
        None
    }

    fn join_multicast_group(&mut self, group: &HostAddress, iface: &NetworkInterface) -> Result<()> {
        let _ = (group, iface);
        Err(self.unsupported("join_multicast_group"))
    }

    fn leave_multicast_group(&mut self, group: &HostAddress, iface: &NetworkInterface) -> Result<()> {
        let _ = (group, iface);
        Err(self.unsupported("leave_multicast_group"))
    }

    fn multicast_interface(&self) -> Option<NetworkInterface> {
        None
    }

    fn set_multicast_interface(&mut self, iface: &NetworkInterface) -> Result<()> {
        let _ = iface;
        Err(self.unsupported("set_multicast_interface"))
    }

    fn option(&self, option: SocketOption) -> Option<i32> {
        let _ = option;
        None
    }

    fn set_option(&mut self, option: SocketOption, value: i32) -> bool {
        let _ = (option, value);
        false
    }

    /// Block until readable or `deadline`. `None` waits forever.
    fn wait_for_read(&mut self, deadline: Option<Instant>) -> Result<Readiness> {
        self.wait_for_read_or_write(true, false, deadline)
    }

    fn wait_for_write(&mut self, deadline: Option<Instant>) -> Result<Readiness> {
        self.wait_for_read_or_write(false, true, deadline)
    }

    fn wait_for_read_or_write(
        &mut self,
        check_read: bool,
        check_write: bool,
        deadline: Option<Instant>,
    ) -> Result<Readiness>;

    // Shared accessors.

    fn socket_type(&self) -> SocketType {
        self.base().socket_type
    }

    fn protocol(&self) -> NetworkLayerProtocol {
        self.base().protocol
    }

    fn state(&self) -> SocketState {
        self.base().state
    }

    /// Last recorded error, or an `Unknown` placeholder.
    fn error(&self) -> SocketError {
        self.base()
            .error
            .clone()
            .unwrap_or_else(|| SocketError::from_kind(SocketErrorKind::Unknown))
    }

    fn error_kind(&self) -> SocketErrorKind {
        self.base()
            .error
            .as_ref()
            .map_or(SocketErrorKind::Unknown, |e| e.kind)
    }

    fn local_address(&self) -> HostAddress {
        self.base().local_address.clone()
    }

    fn local_port(&self) -> u16 {
        self.base().local_port
    }

    fn peer_address(&self) -> HostAddress {
        self.base().peer_address.clone()
    }

    fn peer_port(&self) -> u16 {
        self.base().peer_port
    }

    fn inbound_stream_count(&self) -> i32 {
        self.base().inbound_stream_count
    }

    fn outbound_stream_count(&self) -> i32 {
        self.base().outbound_stream_count
    }

    fn is_read_notification_enabled(&self) -> bool {
        self.base().read_notification
    }

    fn set_read_notification_enabled(&mut self, enabled: bool) {
        self.base_mut().read_notification = enabled;
    }

    fn is_write_notification_enabled(&self) -> bool {
        self.base().write_notification
    }

    fn set_write_notification_enabled(&mut self, enabled: bool) {
        self.base_mut().write_notification = enabled;
    }

    fn is_exception_notification_enabled(&self) -> bool {
        self.base().exception_notification
    }

    fn set_exception_notification_enabled(&mut self, enabled: bool) {
        self.base_mut().exception_notification = enabled;
    }

    /// What an external poller should watch this engine for.
    fn interest(&self) -> Interest {
        let base = self.base();
        Interest {
            read: base.read_notification,
            write: base.write_notification,
            exception: base.exception_notification,
        }
    }

    /// Record and return an unsupported-operation error.
    fn unsupported(&mut self, operation: &'static str) -> SocketError {
        warn!(operation, "operation not supported by engine");
        self.base_mut().fail(SocketError::from_kind(
            SocketErrorKind::UnsupportedSocketOperation,
        ))
    }
}

/// Warn-and-fail helper for calls made in the wrong state.
pub(crate) fn wrong_state(base: &mut EngineState, operation: &'static str) -> SocketError {
    warn!(operation, state = ?base.state, "called in wrong state");
    base.fail_with(
        SocketErrorKind::OperationError,
        format!("{} called in state {:?}", operation, base.state),
    )
}
