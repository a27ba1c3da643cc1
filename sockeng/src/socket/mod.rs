//! Buffered socket state machine over a [`SocketEngine`].
//!
//! [`AbstractSocket`] owns at most one engine at a time and moves through
//! `Unconnected → HostLookup → Connecting → Connected → Closing → Unconnected`,
//! with `Bound` as a side state for sockets bound without a peer.
//!
//! ## Driving the machine
//!
//! - **Event driven**: the owner watches [`AbstractSocket::interest`] and
//!   [`AbstractSocket::next_deadline`], feeds what happened through
//!   [`AbstractSocket::advance`] and drains [`SocketNotification`]s with
//!   [`AbstractSocket::take_notifications`].
//! - **Blocking**: the `wait_for_*` methods run the same transitions with
//!   the engine's own readiness wait.
//!
//! Continuations (try the next address, re-test a connect, finish a
//! disconnect) run through a small `Step` trampoline, so a long candidate
//! list never deepens the stack.

mod io;
#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use bytes::BytesMut;
use sockeng_addr::{HostAddress, NetworkLayerProtocol};
use tracing::{debug, info, trace, warn};

use crate::config::SocketConfig;
use crate::dns::{next_lookup_id, HostInfo, HostResolver, Lookup, LookupId, SystemResolver};
use crate::engine::{
    ConnectProgress, Interest, RawDescriptor, Readiness, SocketEngine, SocketOption, SocketState,
    SocketType,
};
use crate::error::{Result, SocketError, SocketErrorKind};
use crate::proxy::{
    resolve_proxy, NetworkProxy, NoProxyResolver, ProxyCapabilities, ProxyResolver, ProxyType,
};
use crate::registry::EngineRegistry;
use crate::sctp::ChannelSet;
use crate::telemetry::{record_metric, MetricsEvent, MetricsTimer};

bitflags! {
    /// How [`AbstractSocket::bind`] shares the local address.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindMode: u8 {
        /// Let the platform pick (no reuse flag is touched).
        const DEFAULT_FOR_PLATFORM = 0x0;
        const SHARE_ADDRESS = 0x1;
        const DONT_SHARE_ADDRESS = 0x2;
        const REUSE_ADDRESS_HINT = 0x4;
    }
}

/// Something that happened to the socket, delivered by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A lookup started by [`AbstractSocket::connect_to_host`] finished.
    HostResolved(HostInfo),
    Readable,
    Writable,
    /// The per-address connect timer expired.
    ConnectTimeout,
    /// The forced-disconnect timer expired.
    DisconnectTimeout,
}

/// Notifications queued for the socket's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketNotification {
    StateChanged(SocketState),
    HostFound,
    Connected,
    Disconnected,
    /// New data on the current read channel.
    ReadyRead,
    ChannelReadyRead(usize),
    BytesWritten(usize),
    ChannelBytesWritten { channel: usize, bytes: usize },
    ReadChannelFinished,
    ErrorOccurred(SocketError),
}

/// Internal continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    ConnectNextAddress,
    TestConnection,
    Disconnect,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    kind: TimerKind,
    deadline: Instant,
}

pub struct AbstractSocket {
    pub(crate) socket_type: SocketType,
    pub(crate) config: SocketConfig,
    registry: Arc<EngineRegistry>,
    resolver: Arc<dyn HostResolver>,
    proxy_resolver: Arc<dyn ProxyResolver>,
    proxy: NetworkProxy,
    proxy_in_use: NetworkProxy,
    pub(crate) engine: Option<Box<dyn SocketEngine>>,
    pub(crate) state: SocketState,
    pub(crate) error: Option<SocketError>,

    host_name: String,
    peer_name: String,
    port: u16,
    local_address: HostAddress,
    local_port: u16,
    peer_address: HostAddress,
    peer_port: u16,

    addresses: VecDeque<HostAddress>,
    lookup_id: Option<LookupId>,
    timer: Option<Timer>,
    pending_close: bool,
    abort_called: bool,
    connect_started: Option<MetricsTimer>,

    pub(crate) buffered: bool,
    pub(crate) has_pending_data: bool,
    pub(crate) read_buffer_max_size: usize,
    pub(crate) read_channels: ChannelSet,
    pub(crate) write_channels: ChannelSet,
    pub(crate) read_channel_count: usize,
    pub(crate) write_channel_count: usize,
    pub(crate) current_read_channel: usize,
    pub(crate) current_write_channel: usize,
    /// Partially received SCTP message, kept across would-block reads.
    pub(crate) incoming: BytesMut,

    cached_options: Vec<(SocketOption, i32)>,
    pub(crate) notifications: VecDeque<SocketNotification>,
}

impl fmt::Debug for AbstractSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbstractSocket")
            .field("socket_type", &self.socket_type)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("peer_name", &self.peer_name)
            .field("local", &(&self.local_address, self.local_port))
            .field("peer", &(&self.peer_address, self.peer_port))
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl AbstractSocket {
    /// Socket using the global engine registry, the system resolver and no
    /// proxy.
    pub fn new(socket_type: SocketType, config: SocketConfig) -> Self {
        // Datagram reads on UDP always go straight to the engine.
        let buffered = config.buffered && socket_type != SocketType::Udp;
        let read_buffer_max_size = config.read_buffer_max_size;
        let mut socket = Self {
            socket_type,
            config,
            registry: EngineRegistry::global(),
            resolver: Arc::new(SystemResolver::new()),
            proxy_resolver: Arc::new(NoProxyResolver),
            proxy: NetworkProxy::default(),
            proxy_in_use: NetworkProxy::no_proxy(),
            engine: None,
            state: SocketState::Unconnected,
            error: None,
            host_name: String::new(),
            peer_name: String::new(),
            port: 0,
            local_address: HostAddress::default(),
            local_port: 0,
            peer_address: HostAddress::default(),
            peer_port: 0,
            addresses: VecDeque::new(),
            lookup_id: None,
            timer: None,
            pending_close: false,
            abort_called: false,
            connect_started: None,
            buffered,
            has_pending_data: false,
            read_buffer_max_size,
            read_channels: ChannelSet::new(false),
            write_channels: ChannelSet::new(false),
            read_channel_count: 0,
            write_channel_count: 0,
            current_read_channel: 0,
            current_write_channel: 0,
            incoming: BytesMut::new(),
            cached_options: Vec::new(),
            notifications: VecDeque::new(),
        };
        socket.sync_channel_mode();
        socket
    }

    pub fn tcp() -> Self {
        Self::new(SocketType::Tcp, SocketConfig::default())
    }

    pub fn udp() -> Self {
        Self::new(SocketType::Udp, SocketConfig::default())
    }

    pub fn sctp() -> Self {
        Self::new(SocketType::Sctp, SocketConfig::default())
    }

    pub fn with_registry(mut self, registry: Arc<EngineRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_proxy_resolver(mut self, proxy_resolver: Arc<dyn ProxyResolver>) -> Self {
        self.proxy_resolver = proxy_resolver;
        self
    }

    /// Use `proxy` instead of asking the proxy resolver.
    pub fn with_proxy(mut self, proxy: NetworkProxy) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn set_proxy(&mut self, proxy: NetworkProxy) {
        self.proxy = proxy;
    }

    pub fn proxy(&self) -> &NetworkProxy {
        &self.proxy
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Last error surfaced by the socket, or an `Unknown` placeholder.
    pub fn error(&self) -> SocketError {
        self.error
            .clone()
            .unwrap_or_else(|| SocketError::from_kind(SocketErrorKind::Unknown))
    }

    pub fn error_kind(&self) -> SocketErrorKind {
        self.error.as_ref().map_or(SocketErrorKind::Unknown, |e| e.kind)
    }

    pub fn is_valid(&self) -> bool {
        self.engine.as_ref().is_some_and(|e| e.is_valid())
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    pub fn local_address(&self) -> &HostAddress {
        &self.local_address
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn peer_address(&self) -> &HostAddress {
        &self.peer_address
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    /// Name passed to the last `connect_to_host`.
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn descriptor(&self) -> Option<RawDescriptor> {
        self.engine.as_ref().and_then(|e| e.descriptor())
    }

    /// Readiness the owner should watch the descriptor for.
    pub fn interest(&self) -> Interest {
        self.engine.as_ref().map(|e| e.interest()).unwrap_or_default()
    }

    /// When the armed connect or disconnect timer fires, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.map(|t| t.deadline)
    }

    pub fn take_notifications(&mut self) -> Vec<SocketNotification> {
        self.notifications.drain(..).collect()
    }

    // ========================================================================
    // Options
    // ========================================================================

    /// Set `option`, remembering it for engines created later.
    pub fn set_socket_option(&mut self, option: SocketOption, value: i32) -> bool {
        match self.cached_options.iter_mut().find(|(o, _)| *o == option) {
            Some(entry) => entry.1 = value,
            None => self.cached_options.push((option, value)),
        }
        match self.engine.as_mut() {
            Some(engine) => engine.set_option(option, value),
            None => true,
        }
    }

    pub fn socket_option(&self, option: SocketOption) -> Option<i32> {
        if let Some(engine) = self.engine.as_ref() {
            return engine.option(option);
        }
        self.cached_options
            .iter()
            .find(|(o, _)| *o == option)
            .map(|(_, v)| *v)
    }

    // ========================================================================
    // Event entry point
    // ========================================================================

    pub fn advance(&mut self, event: SocketEvent) {
        trace!(?event, state = ?self.state, "advance");
        match event {
            SocketEvent::HostResolved(info) => self.start_connecting(info),
            SocketEvent::Readable => {
                self.on_readable();
            }
            SocketEvent::Writable => {
                self.on_writable();
            }
            SocketEvent::ConnectTimeout => self.on_connect_timeout(),
            SocketEvent::DisconnectTimeout => self.on_disconnect_timeout(),
        }
    }

    /// Deliver a finished lookup if the resolver has one. Returns whether a
    /// result was delivered.
    pub fn poll_host_lookup(&mut self) -> bool {
        let Some(id) = self.lookup_id else {
            return false;
        };
        if self.state != SocketState::HostLookup {
            return false;
        }
        match self.resolver.take_completed(id) {
            Some(info) => {
                self.start_connecting(info);
                true
            }
            None => false,
        }
    }

    /// Fire the armed timer if its deadline is at or before `now`.
    pub fn fire_due_timers(&mut self, now: Instant) -> bool {
        match self.timer {
            Some(timer) if timer.deadline <= now => {
                self.advance(match timer.kind {
                    TimerKind::Connect => SocketEvent::ConnectTimeout,
                    TimerKind::Disconnect => SocketEvent::DisconnectTimeout,
                });
                true
            }
            _ => false,
        }
    }

    fn run(&mut self, mut step: Step) {
        loop {
            step = match step {
                Step::ConnectNextAddress => self.connect_to_next_address(),
                Step::TestConnection => self.test_connection(),
                Step::Disconnect => self.disconnect_step(),
                Step::Done => return,
            };
        }
    }

    // ========================================================================
    // State and error reporting
    // ========================================================================

    pub(crate) fn notify(&mut self, notification: SocketNotification) {
        self.notifications.push_back(notification);
    }

    pub(crate) fn set_state(&mut self, state: SocketState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "socket state changed");
            self.state = state;
            self.notify(SocketNotification::StateChanged(state));
        }
    }

    pub(crate) fn set_error(&mut self, err: SocketError) {
        self.error = Some(err);
    }

    /// Record `err` and queue an `ErrorOccurred`.
    pub(crate) fn emit_error(&mut self, err: SocketError) {
        debug!(kind = ?err.kind, message = %err.message, "socket error");
        record_metric(MetricsEvent::SocketError);
        self.error = Some(err.clone());
        self.notify(SocketNotification::ErrorOccurred(err));
    }

    /// Surface the engine's last error.
    pub(crate) fn engine_error(&self) -> SocketError {
        self.engine
            .as_ref()
            .map(|e| e.error())
            .unwrap_or_else(|| SocketError::from_kind(SocketErrorKind::Unknown))
    }

    fn arm_timer(&mut self, kind: TimerKind, after: Duration) {
        self.timer = Some(Timer {
            kind,
            deadline: Instant::now() + after,
        });
    }

    fn stop_timer(&mut self, kind: TimerKind) {
        if self.timer.is_some_and(|t| t.kind == kind) {
            self.timer = None;
        }
    }

    // ========================================================================
    // Engine lifecycle
    // ========================================================================

    pub(crate) fn reset_socket_layer(&mut self) {
        self.has_pending_data = false;
        if let Some(mut engine) = self.engine.take() {
            trace!("closing engine");
            engine.close();
        }
        self.timer = None;
    }

    fn init_socket_layer(&mut self, protocol: NetworkLayerProtocol) -> bool {
        self.reset_socket_layer();

        let Some(mut engine) = self
            .registry
            .create_engine(self.socket_type, &self.proxy_in_use)
        else {
            self.set_error(SocketError::from_kind(
                SocketErrorKind::UnsupportedSocketOperation,
            ));
            return false;
        };

        if let Err(e) = engine.initialize(self.socket_type, protocol) {
            debug!(error = %e, ?protocol, "engine initialization failed");
            self.set_error(e);
            return false;
        }

        for &(option, value) in &self.cached_options {
            if !engine.set_option(option, value) {
                debug!(?option, value, "cached option not applied");
            }
        }
        if self.socket_type == SocketType::Sctp {
            // Stream mode needs a single stream; 0 keeps the stack default.
            let streams = if self.config.max_channel_count < 0 {
                1
            } else {
                self.config.max_channel_count
            };
            if streams > 0 {
                engine.set_option(SocketOption::MaxStreams, streams);
            }
        }

        self.engine = Some(engine);
        true
    }

    fn can_reuse_bound_engine(&self, protocol: NetworkLayerProtocol) -> bool {
        self.engine.as_ref().is_some_and(|e| {
            e.is_valid()
                && e.state() == SocketState::Bound
                && (e.protocol() == protocol || e.protocol() == NetworkLayerProtocol::AnyIp)
        })
    }

    fn sync_channel_mode(&mut self) {
        let packet_mode = self.is_datagram_mode();
        self.read_channels.set_packet_mode(packet_mode);
        self.write_channels.set_packet_mode(packet_mode);
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    /// Start connecting to `host_name:port`.
    ///
    /// Fails only when the request itself is invalid; resolution and connect
    /// failures are reported through notifications.
    pub fn connect_to_host(&mut self, host_name: &str, port: u16) -> Result<()> {
        debug!(host = host_name, port, state = ?self.state, "connect_to_host");
        if matches!(
            self.state,
            SocketState::HostLookup
                | SocketState::Connecting
                | SocketState::Connected
                | SocketState::Closing
        ) {
            warn!(state = ?self.state, "connect_to_host called while already connecting or connected");
            let err = SocketError::new(
                SocketErrorKind::OperationError,
                "Trying to connect while connection is in progress",
            );
            self.emit_error(err.clone());
            return Err(err);
        }

        self.error = None;
        self.pending_close = false;
        self.abort_called = false;
        self.read_channel_count = 0;
        self.write_channel_count = 0;
        self.current_read_channel = 0;
        self.current_write_channel = 0;
        self.read_channels.clear();
        self.write_channels.clear();
        self.incoming.clear();
        if self.state != SocketState::Bound {
            self.local_port = 0;
            self.local_address.clear();
        }
        self.peer_port = 0;
        self.peer_address.clear();
        self.peer_name = host_name.to_string();
        if let Some(id) = self.lookup_id.take() {
            self.resolver.abort_lookup(id);
        }

        self.proxy_in_use = resolve_proxy(
            &self.proxy,
            self.proxy_resolver.as_ref(),
            self.socket_type,
            host_name,
            port,
        );
        if self.proxy_in_use.proxy_type == ProxyType::DefaultProxy {
            let err = SocketError::new(
                SocketErrorKind::UnsupportedSocketOperation,
                "Operation on socket is not supported",
            );
            self.emit_error(err.clone());
            return Err(err);
        }

        self.host_name = host_name.to_string();
        self.port = port;
        self.connect_started = Some(MetricsTimer::start());
        self.set_state(SocketState::HostLookup);

        if let Some(address) = HostAddress::parse(host_name) {
            let info = HostInfo::new(next_lookup_id(), host_name).with_addresses(vec![address]);
            self.lookup_id = Some(info.lookup_id);
            self.start_connecting(info);
        } else if self.proxy_in_use.proxy_type != ProxyType::NoProxy
            && self
                .proxy_in_use
                .capabilities
                .contains(ProxyCapabilities::HOST_NAME_LOOKUP)
        {
            self.start_connecting_by_name();
        } else {
            match self.resolver.start_lookup(host_name) {
                Lookup::Immediate(info) => {
                    self.lookup_id = Some(info.lookup_id);
                    self.start_connecting(info);
                }
                Lookup::Pending(id) => {
                    trace!(lookup_id = id, "waiting for host lookup");
                    self.lookup_id = Some(id);
                }
            }
        }
        Ok(())
    }

    pub fn connect_to_address(&mut self, address: &HostAddress, port: u16) -> Result<()> {
        self.connect_to_host(&address.to_string(), port)
    }

    /// The proxy resolves the name itself; hand it over unresolved.
    fn start_connecting_by_name(&mut self) {
        debug!(host = %self.host_name, proxy = %self.proxy_in_use.host_name, "connecting by name through proxy");
        self.set_state(SocketState::Connecting);
        if self.init_socket_layer(NetworkLayerProtocol::AnyIp) {
            let host_name = self.host_name.clone();
            let port = self.port;
            let progress = match self.engine.as_mut() {
                Some(engine) => engine.connect_to_host_by_name(&host_name, port),
                None => Err(SocketError::from_kind(SocketErrorKind::Unknown)),
            };
            match progress {
                Ok(ConnectProgress::Connected) => {
                    let step = self.fetch_connection_parameters();
                    self.run(step);
                    return;
                }
                Ok(ConnectProgress::InProgress) => {
                    self.arm_connect_wait();
                    return;
                }
                Err(e) => self.set_error(e),
            }
        }

        self.set_state(SocketState::Unconnected);
        let err = self.error();
        self.emit_error(err);
        record_metric(MetricsEvent::ConnectionFailed);
        self.reset_socket_layer();
    }

    fn start_connecting(&mut self, info: HostInfo) {
        if self.state != SocketState::HostLookup || self.lookup_id != Some(info.lookup_id) {
            warn!(
                lookup_id = info.lookup_id,
                state = ?self.state,
                "ignoring stale host lookup result"
            );
            return;
        }
        self.lookup_id = None;

        let preferred = self.config.preferred_protocol.to_protocol();
        let filtered = info.addresses.iter().filter(|a| {
            matches!(
                preferred,
                NetworkLayerProtocol::AnyIp | NetworkLayerProtocol::Unknown
            ) || a.protocol() == preferred
        });
        let mut addresses = VecDeque::new();
        for address in filtered {
            addresses.push_back(address.clone());
            if self.config.retry_each_address {
                addresses.push_back(address.clone());
            }
        }

        if addresses.is_empty() {
            debug!(host = %info.host_name, "lookup produced no usable address");
            self.set_state(SocketState::Unconnected);
            let message = info.error.unwrap_or_else(|| "Host not found".to_string());
            self.emit_error(SocketError::new(SocketErrorKind::HostNotFound, message));
            record_metric(MetricsEvent::ConnectionFailed);
            return;
        }

        trace!(candidates = addresses.len(), "host lookup finished");
        self.addresses = addresses;
        self.set_state(SocketState::Connecting);
        self.notify(SocketNotification::HostFound);
        self.run(Step::ConnectNextAddress);
    }

    fn connect_to_next_address(&mut self) -> Step {
        loop {
            let Some(address) = self.addresses.pop_front() else {
                return self.connect_exhausted();
            };

            let protocol = address.protocol();
            if !self.can_reuse_bound_engine(protocol) && !self.init_socket_layer(protocol) {
                debug!(%address, "could not create an engine for candidate");
                continue;
            }

            record_metric(MetricsEvent::ConnectAttempt);
            debug!(%address, port = self.port, "trying address");
            let port = self.port;
            let Some(engine) = self.engine.as_mut() else {
                continue;
            };
            match engine.connect_to_host(&address, port) {
                Ok(ConnectProgress::Connected) => return self.fetch_connection_parameters(),
                Ok(ConnectProgress::InProgress) => {
                    self.arm_connect_wait();
                    return Step::Done;
                }
                Err(e) => {
                    debug!(%address, error = %e, "candidate failed");
                    if e.is_proxy_error() {
                        self.addresses.clear();
                    }
                }
            }
        }
    }

    fn arm_connect_wait(&mut self) {
        let timeout = self.config.connect_timeout();
        self.arm_timer(TimerKind::Connect, timeout);
        if let Some(engine) = self.engine.as_mut() {
            engine.set_write_notification_enabled(true);
        }
    }

    fn connect_exhausted(&mut self) -> Step {
        let err = match self.engine.as_ref() {
            Some(engine)
                if engine.error_kind() == SocketErrorKind::Unknown
                    && engine.state() == SocketState::Connecting =>
            {
                SocketError::from_kind(SocketErrorKind::ConnectionRefused)
            }
            Some(engine) => engine.error(),
            None => self.error(),
        };
        info!(host = %self.host_name, port = self.port, error = %err, "could not connect to any address");
        self.stop_timer(TimerKind::Connect);
        self.set_state(SocketState::Unconnected);
        self.emit_error(err);
        record_metric(MetricsEvent::ConnectionFailed);
        Step::Done
    }

    fn on_connection_notification(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if engine.connection_notification() != SocketState::Connecting {
            self.run(Step::TestConnection);
        }
    }

    fn test_connection(&mut self) -> Step {
        self.stop_timer(TimerKind::Connect);
        let Some(engine) = self.engine.as_ref() else {
            return Step::ConnectNextAddress;
        };
        if engine.state() == SocketState::Connected {
            self.addresses.clear();
            return self.fetch_connection_parameters();
        }
        if engine.error_kind().is_proxy_error() {
            debug!(error = %engine.error(), "proxy error, dropping remaining candidates");
            self.addresses.clear();
        }
        Step::ConnectNextAddress
    }

    fn fetch_connection_parameters(&mut self) -> Step {
        self.stop_timer(TimerKind::Connect);
        let datagram_mode = self.is_datagram_mode();
        let Some(engine) = self.engine.as_mut() else {
            return Step::Done;
        };
        engine.set_read_notification_enabled(true);
        engine.set_write_notification_enabled(true);

        self.local_address = engine.local_address();
        self.local_port = engine.local_port();
        self.peer_address = engine.peer_address();
        self.peer_port = engine.peer_port();
        let (inbound, outbound) = if datagram_mode {
            (
                engine.inbound_stream_count().max(1) as usize,
                engine.outbound_stream_count().max(1) as usize,
            )
        } else {
            (1, 1)
        };
        self.read_channel_count = inbound;
        self.write_channel_count = outbound;
        self.read_channels.resize(inbound);
        self.write_channels.resize(outbound);

        info!(
            peer = %self.peer_address,
            peer_port = self.peer_port,
            local = %self.local_address,
            local_port = self.local_port,
            "connected"
        );
        let duration_ms = self.connect_started.take().map_or(0, |t| t.elapsed_ms());
        record_metric(MetricsEvent::ConnectionEstablished { duration_ms });

        self.set_state(SocketState::Connected);
        self.notify(SocketNotification::Connected);

        if self.pending_close {
            self.pending_close = false;
            return Step::Disconnect;
        }
        Step::Done
    }

    fn on_connect_timeout(&mut self) {
        if self.state != SocketState::Connecting
            || !self.timer.is_some_and(|t| t.kind == TimerKind::Connect)
        {
            return;
        }
        self.timer = None;
        debug!(host = %self.host_name, "connect attempt timed out");
        if let Some(engine) = self.engine.as_mut() {
            engine.set_write_notification_enabled(false);
        }
        if self.addresses.is_empty() {
            self.reset_socket_layer();
            self.set_state(SocketState::Unconnected);
            self.emit_error(SocketError::new(
                SocketErrorKind::SocketTimeout,
                "Connection timed out",
            ));
            record_metric(MetricsEvent::ConnectionFailed);
        } else {
            self.run(Step::ConnectNextAddress);
        }
    }

    // ========================================================================
    // Disconnecting
    // ========================================================================

    /// Close gracefully, flushing queued writes first.
    pub fn disconnect_from_host(&mut self) {
        debug!(state = ?self.state, "disconnect_from_host");
        self.run(Step::Disconnect);
    }

    /// Close immediately, dropping unsent data.
    pub fn abort(&mut self) {
        debug!(state = ?self.state, "abort");
        self.write_channels.clear();
        if self.state == SocketState::Unconnected {
            return;
        }
        self.abort_called = true;
        self.run(Step::Disconnect);
        self.read_channels.clear();
        self.incoming.clear();
    }

    /// Disconnect and drop any unread data.
    pub fn close(&mut self) {
        self.disconnect_from_host();
        self.read_channels.clear();
        self.incoming.clear();
    }

    fn disconnect_step(&mut self) -> Step {
        if self.state == SocketState::Unconnected {
            return Step::Done;
        }
        if !self.abort_called
            && matches!(self.state, SocketState::Connecting | SocketState::HostLookup)
        {
            trace!("close deferred until the connect attempt resolves");
            self.pending_close = true;
            return Step::Done;
        }

        if let Some(engine) = self.engine.as_mut() {
            engine.set_read_notification_enabled(false);
        }

        if self.abort_called {
            if self.state == SocketState::HostLookup {
                if let Some(id) = self.lookup_id.take() {
                    self.resolver.abort_lookup(id);
                }
            }
        } else {
            self.set_state(SocketState::Closing);
            let pending_writes = self.engine.as_ref().is_some_and(|e| {
                e.is_valid() && (!self.write_channels.all_empty() || e.bytes_to_write() > 0)
            });
            if pending_writes {
                if !self.timer.is_some_and(|t| t.kind == TimerKind::Disconnect) {
                    let grace = self.config.disconnect_timeout();
                    self.arm_timer(TimerKind::Disconnect, grace);
                }
                if let Some(engine) = self.engine.as_mut() {
                    engine.set_write_notification_enabled(true);
                }
                trace!(pending = self.write_channels.total_len(), "waiting for writes to drain");
                return Step::Done;
            }
        }

        let previous = self.state;
        self.reset_socket_layer();
        self.addresses.clear();
        self.lookup_id = None;
        self.set_state(SocketState::Unconnected);
        if matches!(previous, SocketState::Connected | SocketState::Closing) {
            self.notify(SocketNotification::ReadChannelFinished);
            info!(peer = %self.peer_address, peer_port = self.peer_port, "disconnected");
            self.notify(SocketNotification::Disconnected);
            record_metric(MetricsEvent::ConnectionClosed);
        }

        self.local_port = 0;
        self.peer_port = 0;
        self.local_address.clear();
        self.peer_address.clear();
        self.write_channel_count = 0;
        self.write_channels.clear();
        Step::Done
    }

    fn on_disconnect_timeout(&mut self) {
        if !self.timer.is_some_and(|t| t.kind == TimerKind::Disconnect) {
            return;
        }
        self.timer = None;
        if self.state == SocketState::Closing && self.is_valid() {
            warn!(
                unsent = self.write_channels.total_len(),
                "forcing disconnect with unsent data"
            );
            if let Some(engine) = self.engine.as_mut() {
                engine.close();
            }
            self.run(Step::Disconnect);
        }
    }

    // ========================================================================
    // Binding and adoption
    // ========================================================================

    pub fn bind(&mut self, address: &HostAddress, port: u16, mode: BindMode) -> Result<()> {
        debug!(%address, port, ?mode, "bind");
        self.abort_called = false;
        self.pending_close = false;
        if !self.is_valid() {
            self.proxy_in_use = resolve_proxy(
                &self.proxy,
                self.proxy_resolver.as_ref(),
                self.socket_type,
                "",
                port,
            );
            let protocol = match address.protocol() {
                NetworkLayerProtocol::Unknown => NetworkLayerProtocol::AnyIp,
                protocol => protocol,
            };
            if !self.init_socket_layer(protocol) {
                let err = self.error();
                self.emit_error(err.clone());
                return Err(err);
            }
        }

        let result = match self.engine.as_mut() {
            Some(engine) => {
                if mode != BindMode::DEFAULT_FOR_PLATFORM {
                    let reuse = mode
                        .intersects(BindMode::SHARE_ADDRESS | BindMode::REUSE_ADDRESS_HINT);
                    engine.set_option(SocketOption::AddressReusable, i32::from(reuse));
                }
                engine.bind(address, port)
            }
            None => Err(SocketError::from_kind(SocketErrorKind::Unknown)),
        };
        if let Err(e) = result {
            self.emit_error(e.clone());
            return Err(e);
        }

        if let Some(engine) = self.engine.as_mut() {
            self.local_address = engine.local_address();
            self.local_port = engine.local_port();
            if self.socket_type == SocketType::Udp {
                engine.set_read_notification_enabled(true);
            }
        }
        self.set_state(SocketState::Bound);
        Ok(())
    }

    /// Adopt an already open descriptor, e.g. one accepted by a listener.
    pub fn set_socket_descriptor(
        &mut self,
        descriptor: RawDescriptor,
        state: SocketState,
    ) -> Result<()> {
        self.reset_socket_layer();
        self.abort_called = false;
        self.pending_close = false;
        self.read_channel_count = 0;
        self.write_channel_count = 0;

        let Some(mut engine) = self.registry.create_engine_from_descriptor(descriptor) else {
            let err = SocketError::from_kind(SocketErrorKind::UnsupportedSocketOperation);
            self.set_error(err.clone());
            return Err(err);
        };
        if let Err(e) = engine.initialize_from_descriptor(descriptor, state) {
            self.set_error(e.clone());
            return Err(e);
        }
        self.error = None;
        self.socket_type = engine.socket_type();
        self.buffered = self.config.buffered && self.socket_type != SocketType::Udp;
        self.sync_channel_mode();

        if state == SocketState::Connected {
            let (inbound, outbound) = if self.is_datagram_mode() {
                (
                    engine.inbound_stream_count().max(1) as usize,
                    engine.outbound_stream_count().max(1) as usize,
                )
            } else {
                (1, 1)
            };
            self.read_channel_count = inbound;
            self.write_channel_count = outbound;
            self.read_channels.resize(inbound);
            self.write_channels.resize(outbound);
        }

        engine.set_read_notification_enabled(true);
        self.local_address = engine.local_address();
        self.local_port = engine.local_port();
        self.peer_address = engine.peer_address();
        self.peer_port = engine.peer_port();
        self.pending_close = false;
        self.engine = Some(engine);
        debug!(descriptor, ?state, peer = %self.peer_address, "adopted descriptor");
        self.set_state(state);
        Ok(())
    }

    // ========================================================================
    // Blocking waits
    // ========================================================================

    /// One engine wait bounded by both `deadline` and the armed timer.
    ///
    /// A timer expiring first is fired and reported as a spurious wake-up.
    fn wait_once(
        &mut self,
        check_read: bool,
        check_write: bool,
        deadline: Option<Instant>,
    ) -> Result<Readiness> {
        let timer = self.next_deadline();
        let effective = match (deadline, timer) {
            (Some(d), Some(t)) => Some(d.min(t)),
            (d, t) => d.or(t),
        };
        let Some(engine) = self.engine.as_mut() else {
            return Err(SocketError::new(
                SocketErrorKind::OperationError,
                "Socket is not connected",
            ));
        };
        let ready = engine.wait_for_read_or_write(check_read, check_write, effective)?;
        if ready.timed_out && self.fire_due_timers(Instant::now()) {
            return Ok(Readiness::default());
        }
        Ok(ready)
    }

    fn deadline_passed(deadline: Option<Instant>) -> bool {
        deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn wait_timed_out(&mut self) -> SocketError {
        let err = SocketError::new(SocketErrorKind::SocketTimeout, "Socket operation timed out");
        self.emit_error(err.clone());
        err
    }

    /// Report a failed wait; anything but a timeout closes the socket.
    fn wait_failed(&mut self, err: SocketError) -> SocketError {
        if err.kind != SocketErrorKind::SocketTimeout {
            self.close();
        }
        self.emit_error(err.clone());
        err
    }

    /// Block until connected or `timeout` elapses. `None` waits forever.
    pub fn wait_for_connected(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.state {
            SocketState::Connected => return Ok(()),
            SocketState::Unconnected => {
                return Err(self.error.clone().unwrap_or_else(|| {
                    SocketError::new(SocketErrorKind::OperationError, "Socket is not connecting")
                }))
            }
            _ => {}
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let was_pending_close = std::mem::take(&mut self.pending_close);

        if self.state == SocketState::HostLookup {
            if let Some(id) = self.lookup_id.take() {
                self.resolver.abort_lookup(id);
            }
            let mut info = match HostAddress::parse(&self.host_name) {
                Some(address) => {
                    HostInfo::new(next_lookup_id(), self.host_name.clone())
                        .with_addresses(vec![address])
                }
                None => self.resolver.lookup_blocking(&self.host_name),
            };
            if info.lookup_id <= 0 {
                info.lookup_id = next_lookup_id();
            }
            self.lookup_id = Some(info.lookup_id);
            self.start_connecting(info);
        }
        if self.state == SocketState::Unconnected {
            return Err(self.error());
        }

        let mut timed_out = false;
        while self.state == SocketState::Connecting {
            if Self::deadline_passed(deadline) {
                timed_out = true;
                break;
            }
            let slice = Instant::now() + self.config.connect_timeout();
            let slice_deadline = Some(deadline.map_or(slice, |d| d.min(slice)));
            let interest = self.interest();
            let waited = match self.engine.as_mut() {
                Some(engine) => engine.wait_for_read_or_write(
                    interest.read,
                    interest.write || !interest.read,
                    slice_deadline,
                ),
                None => break,
            };
            match waited {
                Ok(ready) if !ready.timed_out => {
                    self.advance(if ready.writable {
                        SocketEvent::Writable
                    } else {
                        SocketEvent::Readable
                    });
                }
                Ok(_) if Self::deadline_passed(deadline) => {
                    timed_out = true;
                    break;
                }
                _ => {
                    self.stop_timer(TimerKind::Connect);
                    self.run(Step::ConnectNextAddress);
                }
            }
        }

        if self.state == SocketState::Connecting || (timed_out && self.state != SocketState::Connected) {
            self.timer = None;
            self.addresses.clear();
            self.set_state(SocketState::Unconnected);
            let err = self.wait_timed_out();
            self.reset_socket_layer();
            return Err(err);
        }
        if self.state == SocketState::Connected {
            if was_pending_close {
                self.disconnect_from_host();
            }
            return Ok(());
        }
        Err(self.error())
    }

    /// Block until new data is available to read.
    pub fn wait_for_ready_read(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.state == SocketState::Unconnected {
            return Err(SocketError::new(
                SocketErrorKind::OperationError,
                "Socket is not connected",
            ));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        if matches!(self.state, SocketState::HostLookup | SocketState::Connecting) {
            self.wait_for_connected(timeout)?;
        }

        loop {
            if !matches!(self.state, SocketState::Connected | SocketState::Bound) {
                return Err(self.error());
            }
            let check_write = !self.write_channels.all_empty();
            let ready = match self.wait_once(true, check_write, deadline) {
                Ok(ready) => ready,
                Err(e) => return Err(self.wait_failed(e)),
            };
            if ready.timed_out {
                return Err(self.wait_timed_out());
            }
            if ready.readable && self.on_readable() {
                return Ok(());
            }
            if ready.writable {
                self.on_writable();
            }
            if Self::deadline_passed(deadline) {
                return Err(self.wait_timed_out());
            }
        }
    }

    /// Block until at least one queued write reaches the engine.
    pub fn wait_for_bytes_written(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.buffered && self.write_channels.all_empty() {
            return Err(SocketError::new(
                SocketErrorKind::OperationError,
                "No pending data to write",
            ));
        }
        if self.state == SocketState::Unconnected {
            return Err(self.error());
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        if matches!(self.state, SocketState::HostLookup | SocketState::Connecting) {
            self.wait_for_connected(timeout)?;
        }

        loop {
            if self.state == SocketState::Unconnected {
                return Err(self.error());
            }
            let check_read = self.state == SocketState::Connected;
            let check_write = !self.write_channels.all_empty();
            let ready = match self.wait_once(check_read, check_write, deadline) {
                Ok(ready) => ready,
                Err(e) => return Err(self.wait_failed(e)),
            };
            if ready.timed_out {
                return Err(self.wait_timed_out());
            }
            if ready.readable {
                self.on_readable();
            }
            if ready.writable && self.on_writable() {
                return Ok(());
            }
            if Self::deadline_passed(deadline) {
                return Err(self.wait_timed_out());
            }
        }
    }

    /// Block until the socket reaches `Unconnected`.
    pub fn wait_for_disconnected(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.state == SocketState::Unconnected {
            warn!("wait_for_disconnected is not allowed while unconnected");
            return Err(SocketError::new(
                SocketErrorKind::OperationError,
                "Socket is not connected",
            ));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        if matches!(self.state, SocketState::HostLookup | SocketState::Connecting) {
            self.wait_for_connected(timeout)?;
            if self.state == SocketState::Unconnected {
                return Ok(());
            }
        }

        loop {
            let check_read = self.state == SocketState::Connected;
            let check_write = !self.write_channels.all_empty();
            let ready = match self.wait_once(check_read, check_write, deadline) {
                Ok(ready) => ready,
                Err(e) => return Err(self.wait_failed(e)),
            };
            if ready.timed_out {
                return Err(self.wait_timed_out());
            }
            if ready.readable {
                self.on_readable();
            }
            if ready.writable {
                self.on_writable();
            }
            if self.state == SocketState::Unconnected {
                return Ok(());
            }
            if Self::deadline_passed(deadline) {
                return Err(self.wait_timed_out());
            }
        }
    }
}

impl Drop for AbstractSocket {
    fn drop(&mut self) {
        if let Some(id) = self.lookup_id.take() {
            self.resolver.abort_lookup(id);
        }
        if self.state != SocketState::Unconnected {
            self.abort();
        }
    }
}
