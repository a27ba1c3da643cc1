//! State machine tests driven by a scripted in-memory engine.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sockeng_addr::{HostAddress, NetworkLayerProtocol};

use super::*;
use crate::config::{PreferredProtocol, SocketConfig};
use crate::dns::{next_lookup_id, HostInfo, HostResolver, Lookup, LookupId};
use crate::engine::{
    ConnectProgress, EngineState, RawDescriptor, Readiness, SocketEngine, SocketOption,
    SocketState, SocketType, Transfer,
};
use crate::error::{Result, SocketError, SocketErrorKind};
use crate::packet::{IpPacketHeader, NetworkDatagram, PacketHeaderOptions};
use crate::proxy::{NetworkProxy, ProxyQuery, ProxyResolver, ProxyType, StaticProxyResolver};
use crate::registry::EngineRegistry;

// ============================================================================
// Scripted engine
// ============================================================================

#[derive(Debug, Default)]
struct Wire {
    /// One entry per connect attempt; an empty script connects at once.
    connect_script: VecDeque<std::result::Result<ConnectProgress, SocketErrorKind>>,
    /// Outcome of the next connection notification while connecting.
    on_notification: Option<std::result::Result<(), SocketErrorKind>>,
    connects: Vec<HostAddress>,
    engines_created: usize,
    closed: usize,
    options: Vec<(SocketOption, i32)>,
    /// Stream bytes; an empty chunk reads as a remote close.
    incoming: VecDeque<Vec<u8>>,
    incoming_datagrams: VecDeque<(Vec<u8>, IpPacketHeader)>,
    /// Bytes the engine accepts before blocking; `None` is unlimited.
    write_budget: Option<usize>,
    written: Vec<u8>,
    sent_datagrams: Vec<(Vec<u8>, IpPacketHeader)>,
    streams: (i32, i32),
}

type SharedWire = Arc<Mutex<Wire>>;

#[derive(Debug)]
struct MockEngine {
    base: EngineState,
    wire: SharedWire,
    valid: bool,
}

impl MockEngine {
    fn new(wire: SharedWire) -> Self {
        wire.lock().engines_created += 1;
        Self {
            base: EngineState::default(),
            wire,
            valid: false,
        }
    }

    fn become_connected(&mut self) {
        let (inbound, outbound) = self.wire.lock().streams;
        self.base.state = SocketState::Connected;
        self.base.local_address = HostAddress::parse("10.0.0.1").unwrap();
        self.base.local_port = 40_000;
        self.base.inbound_stream_count = inbound;
        self.base.outbound_stream_count = outbound;
    }
}

impl SocketEngine for MockEngine {
    fn base(&self) -> &EngineState {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EngineState {
        &mut self.base
    }

    fn initialize(&mut self, socket_type: SocketType, protocol: NetworkLayerProtocol) -> Result<()> {
        self.base = EngineState {
            socket_type,
            protocol,
            ..EngineState::default()
        };
        self.valid = true;
        Ok(())
    }

    fn initialize_from_descriptor(&mut self, _: RawDescriptor, state: SocketState) -> Result<()> {
        self.valid = true;
        self.base.socket_type = SocketType::Tcp;
        if state == SocketState::Connected {
            self.become_connected();
        }
        self.base.state = state;
        Ok(())
    }

    fn descriptor(&self) -> Option<RawDescriptor> {
        self.valid.then_some(7)
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn connect_to_host(&mut self, address: &HostAddress, port: u16) -> Result<ConnectProgress> {
        let step = {
            let mut wire = self.wire.lock();
            wire.connects.push(address.clone());
            wire.connect_script.pop_front()
        };
        self.base.peer_address = address.clone();
        self.base.peer_port = port;
        match step {
            None | Some(Ok(ConnectProgress::Connected)) => {
                self.become_connected();
                Ok(ConnectProgress::Connected)
            }
            Some(Ok(ConnectProgress::InProgress)) => {
                self.base.state = SocketState::Connecting;
                Ok(ConnectProgress::InProgress)
            }
            Some(Err(kind)) => {
                self.base.state = SocketState::Unconnected;
                Err(self.base.fail(SocketError::from_kind(kind)))
            }
        }
    }

    fn connection_notification(&mut self) -> SocketState {
        if self.base.state == SocketState::Connecting {
            let outcome = self.wire.lock().on_notification.take();
            match outcome {
                Some(Ok(())) => self.become_connected(),
                Some(Err(kind)) => {
                    self.base.state = SocketState::Unconnected;
                    self.base.fail(SocketError::from_kind(kind));
                }
                None => {}
            }
        }
        self.base.state
    }

    fn bind(&mut self, address: &HostAddress, port: u16) -> Result<()> {
        self.base.state = SocketState::Bound;
        self.base.local_address = address.clone();
        self.base.local_port = if port == 0 { 50_000 } else { port };
        Ok(())
    }

    fn close(&mut self) {
        if self.valid {
            self.wire.lock().closed += 1;
        }
        self.valid = false;
        self.base.state = SocketState::Unconnected;
    }

    fn bytes_available(&self) -> usize {
        let wire = self.wire.lock();
        match self.base.socket_type {
            SocketType::Sctp => wire.incoming_datagrams.front().map_or(0, |d| d.0.len()),
            _ => wire.incoming.front().map_or(0, Vec::len),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        let chunk = self.wire.lock().incoming.pop_front();
        let Some(mut chunk) = chunk else {
            return Ok(Transfer::WouldBlock);
        };
        if chunk.is_empty() {
            self.close();
            return Err(self
                .base
                .fail(SocketError::from_kind(SocketErrorKind::RemoteHostClosed)));
        }
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.wire.lock().incoming.push_front(chunk.split_off(n));
        }
        Ok(Transfer::Done(n))
    }

    fn write(&mut self, data: &[u8]) -> Result<Transfer> {
        let mut wire = self.wire.lock();
        let n = match wire.write_budget {
            Some(0) => return Ok(Transfer::WouldBlock),
            Some(budget) => budget.min(data.len()),
            None => data.len(),
        };
        if let Some(budget) = wire.write_budget.as_mut() {
            *budget -= n;
        }
        wire.written.extend_from_slice(&data[..n]);
        Ok(Transfer::Done(n))
    }

    fn read_datagram(
        &mut self,
        buf: &mut [u8],
        _: PacketHeaderOptions,
    ) -> Result<Transfer<(usize, IpPacketHeader)>> {
        let Some((data, header)) = self.wire.lock().incoming_datagrams.pop_front() else {
            return Ok(Transfer::WouldBlock);
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(Transfer::Done((n, header)))
    }

    fn write_datagram(&mut self, data: &[u8], header: &IpPacketHeader) -> Result<Transfer> {
        let mut wire = self.wire.lock();
        if wire.write_budget == Some(0) {
            return Ok(Transfer::WouldBlock);
        }
        wire.sent_datagrams.push((data.to_vec(), header.clone()));
        Ok(Transfer::Done(data.len()))
    }

    fn set_option(&mut self, option: SocketOption, value: i32) -> bool {
        self.wire.lock().options.push((option, value));
        true
    }

    fn wait_for_read_or_write(
        &mut self,
        check_read: bool,
        check_write: bool,
        _: Option<Instant>,
    ) -> Result<Readiness> {
        let readable = check_read && !self.wire.lock().incoming.is_empty();
        Ok(Readiness {
            readable,
            writable: check_write,
            timed_out: !readable && !check_write,
        })
    }
}

// ============================================================================
// Scripted collaborators
// ============================================================================

#[derive(Default)]
struct ScriptedResolver {
    answers: HashMap<String, Vec<HostAddress>>,
    deferred: bool,
    started: Mutex<Vec<(LookupId, String)>>,
    aborted: Mutex<Vec<LookupId>>,
}

impl ScriptedResolver {
    fn answer(&self, id: LookupId, name: &str) -> HostInfo {
        let mut info = HostInfo::new(id, name);
        match self.answers.get(name) {
            Some(addresses) => info.addresses = addresses.clone(),
            None => info.error = Some("Host not found".to_string()),
        }
        info
    }
}

impl HostResolver for ScriptedResolver {
    fn start_lookup(&self, name: &str) -> Lookup {
        let id = next_lookup_id();
        self.started.lock().push((id, name.to_string()));
        if self.deferred {
            Lookup::Pending(id)
        } else {
            Lookup::Immediate(self.answer(id, name))
        }
    }

    fn abort_lookup(&self, id: LookupId) {
        self.aborted.lock().push(id);
    }

    fn take_completed(&self, _: LookupId) -> Option<HostInfo> {
        None
    }

    fn lookup_blocking(&self, name: &str) -> HostInfo {
        self.answer(next_lookup_id(), name)
    }
}

struct EmptyProxyResolver;

impl ProxyResolver for EmptyProxyResolver {
    fn proxies_for(&self, _: &ProxyQuery) -> Vec<NetworkProxy> {
        Vec::new()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn addr(text: &str) -> HostAddress {
    HostAddress::parse(text).unwrap()
}

fn mock_registry(wire: &SharedWire) -> Arc<EngineRegistry> {
    let wire = Arc::clone(wire);
    Arc::new(EngineRegistry::with_native_factory(move || {
        Some(Box::new(MockEngine::new(Arc::clone(&wire))) as Box<dyn SocketEngine>)
    }))
}

fn socket_with(
    socket_type: SocketType,
    config: SocketConfig,
    wire: &SharedWire,
    resolver: ScriptedResolver,
) -> AbstractSocket {
    AbstractSocket::new(socket_type, config)
        .with_registry(mock_registry(wire))
        .with_resolver(Arc::new(resolver))
        .with_proxy(NetworkProxy::no_proxy())
}

fn tcp_socket(wire: &SharedWire) -> AbstractSocket {
    socket_with(
        SocketType::Tcp,
        SocketConfig::default(),
        wire,
        ScriptedResolver::default(),
    )
}

fn connected_tcp(wire: &SharedWire) -> AbstractSocket {
    let mut socket = tcp_socket(wire);
    socket.connect_to_host("10.1.2.3", 80).unwrap();
    assert_eq!(socket.state(), SocketState::Connected);
    socket.take_notifications();
    socket
}

fn states(notes: &[SocketNotification]) -> Vec<SocketState> {
    notes
        .iter()
        .filter_map(|n| match n {
            SocketNotification::StateChanged(s) => Some(*s),
            _ => None,
        })
        .collect()
}

fn error_kinds(notes: &[SocketNotification]) -> Vec<SocketErrorKind> {
    notes
        .iter()
        .filter_map(|n| match n {
            SocketNotification::ErrorOccurred(e) => Some(e.kind),
            _ => None,
        })
        .collect()
}

fn count(notes: &[SocketNotification], wanted: &SocketNotification) -> usize {
    notes.iter().filter(|n| *n == wanted).count()
}

// ============================================================================
// Connecting
// ============================================================================

#[test]
fn test_literal_address_connects_immediately() {
    let wire = SharedWire::default();
    let mut socket = tcp_socket(&wire);
    socket.connect_to_host("10.1.2.3", 80).unwrap();

    let notes = socket.take_notifications();
    assert_eq!(
        notes,
        vec![
            SocketNotification::StateChanged(SocketState::HostLookup),
            SocketNotification::StateChanged(SocketState::Connecting),
            SocketNotification::HostFound,
            SocketNotification::StateChanged(SocketState::Connected),
            SocketNotification::Connected,
        ]
    );
    assert_eq!(socket.peer_name(), "10.1.2.3");
    assert_eq!(socket.peer_address(), &addr("10.1.2.3"));
    assert_eq!(socket.peer_port(), 80);
    assert_eq!(socket.local_port(), 40_000);
    assert_eq!(socket.read_channel_count(), 1);
    assert_eq!(socket.write_channel_count(), 1);
    assert!(socket.interest().read);
    assert_eq!(wire.lock().connects, vec![addr("10.1.2.3")]);
}

#[test]
fn test_connect_in_progress_completes_on_writable() {
    let wire = SharedWire::default();
    wire.lock()
        .connect_script
        .push_back(Ok(ConnectProgress::InProgress));
    let mut socket = tcp_socket(&wire);
    socket.connect_to_host("10.1.2.3", 80).unwrap();
    assert_eq!(socket.state(), SocketState::Connecting);
    assert!(socket.next_deadline().is_some());
    assert!(socket.interest().write);

    // Still pending: nothing changes.
    socket.advance(SocketEvent::Writable);
    assert_eq!(socket.state(), SocketState::Connecting);

    wire.lock().on_notification = Some(Ok(()));
    socket.advance(SocketEvent::Writable);
    assert_eq!(socket.state(), SocketState::Connected);
    assert!(socket.next_deadline().is_none());
    assert!(socket
        .take_notifications()
        .contains(&SocketNotification::Connected));
}

#[test]
fn test_connect_rejected_while_busy() {
    let wire = SharedWire::default();
    wire.lock()
        .connect_script
        .push_back(Ok(ConnectProgress::InProgress));
    let mut socket = tcp_socket(&wire);
    socket.connect_to_host("10.1.2.3", 80).unwrap();
    socket.take_notifications();

    let err = socket.connect_to_host("10.9.9.9", 81).unwrap_err();
    assert_eq!(err.kind, SocketErrorKind::OperationError);
    assert_eq!(socket.state(), SocketState::Connecting);
    assert_eq!(
        error_kinds(&socket.take_notifications()),
        vec![SocketErrorKind::OperationError]
    );
    assert_eq!(wire.lock().connects.len(), 1);
}

#[test]
fn test_refused_candidates_are_each_tried_twice() {
    let wire = SharedWire::default();
    for _ in 0..4 {
        wire.lock()
            .connect_script
            .push_back(Err(SocketErrorKind::ConnectionRefused));
    }
    let mut resolver = ScriptedResolver::default();
    resolver.answers.insert(
        "db.internal".into(),
        vec![addr("10.0.0.5"), addr("10.0.0.6")],
    );
    let mut socket = socket_with(SocketType::Tcp, SocketConfig::default(), &wire, resolver);
    socket.connect_to_host("db.internal", 5432).unwrap();

    assert_eq!(
        wire.lock().connects,
        vec![
            addr("10.0.0.5"),
            addr("10.0.0.5"),
            addr("10.0.0.6"),
            addr("10.0.0.6")
        ]
    );
    assert_eq!(wire.lock().engines_created, 4);
    assert_eq!(socket.state(), SocketState::Unconnected);
    let notes = socket.take_notifications();
    assert_eq!(
        states(&notes),
        vec![
            SocketState::HostLookup,
            SocketState::Connecting,
            SocketState::Unconnected
        ]
    );
    assert_eq!(error_kinds(&notes), vec![SocketErrorKind::ConnectionRefused]);
    assert_eq!(socket.error_kind(), SocketErrorKind::ConnectionRefused);
}

#[test]
fn test_retry_knob_disables_doubling() {
    let wire = SharedWire::default();
    for _ in 0..2 {
        wire.lock()
            .connect_script
            .push_back(Err(SocketErrorKind::ConnectionRefused));
    }
    let mut resolver = ScriptedResolver::default();
    resolver
        .answers
        .insert("db".into(), vec![addr("10.0.0.5"), addr("10.0.0.6")]);
    let config = SocketConfig {
        retry_each_address: false,
        ..SocketConfig::default()
    };
    let mut socket = socket_with(SocketType::Tcp, config, &wire, resolver);
    socket.connect_to_host("db", 1).unwrap();
    assert_eq!(wire.lock().connects.len(), 2);
    assert_eq!(socket.state(), SocketState::Unconnected);
}

#[test]
fn test_preferred_protocol_filters_candidates() {
    let wire = SharedWire::default();
    let mut resolver = ScriptedResolver::default();
    resolver
        .answers
        .insert("dual".into(), vec![addr("10.0.0.5"), addr("fd00::5")]);
    let config = SocketConfig {
        preferred_protocol: PreferredProtocol::Ipv6,
        retry_each_address: false,
        ..SocketConfig::default()
    };
    let mut socket = socket_with(SocketType::Tcp, config, &wire, resolver);
    socket.connect_to_host("dual", 443).unwrap();
    assert_eq!(wire.lock().connects, vec![addr("fd00::5")]);
    assert_eq!(socket.state(), SocketState::Connected);
}

#[test]
fn test_no_usable_address_is_host_not_found() {
    let wire = SharedWire::default();
    let mut resolver = ScriptedResolver::default();
    resolver.answers.insert("v4only".into(), vec![addr("10.0.0.5")]);
    let config = SocketConfig {
        preferred_protocol: PreferredProtocol::Ipv6,
        ..SocketConfig::default()
    };
    let mut socket = socket_with(SocketType::Tcp, config, &wire, resolver);
    socket.connect_to_host("v4only", 443).unwrap();

    let notes = socket.take_notifications();
    assert_eq!(
        states(&notes),
        vec![SocketState::HostLookup, SocketState::Unconnected]
    );
    assert_eq!(error_kinds(&notes), vec![SocketErrorKind::HostNotFound]);
    assert!(wire.lock().connects.is_empty());
}

#[test]
fn test_deferred_lookup_and_stale_results() {
    let wire = SharedWire::default();
    let resolver = Arc::new(ScriptedResolver {
        deferred: true,
        ..ScriptedResolver::default()
    });
    let mut socket = AbstractSocket::tcp()
        .with_registry(mock_registry(&wire))
        .with_resolver(Arc::clone(&resolver) as Arc<dyn HostResolver>)
        .with_proxy(NetworkProxy::no_proxy());
    socket.connect_to_host("svc.local", 8080).unwrap();
    assert_eq!(socket.state(), SocketState::HostLookup);
    let (id, name) = resolver.started.lock()[0].clone();
    assert_eq!(name, "svc.local");

    // A result for another lookup is ignored.
    let stale = HostInfo::new(id + 1000, "svc.local").with_addresses(vec![addr("10.0.0.9")]);
    socket.advance(SocketEvent::HostResolved(stale));
    assert_eq!(socket.state(), SocketState::HostLookup);

    let info = HostInfo::new(id, "svc.local").with_addresses(vec![addr("10.0.0.7")]);
    socket.advance(SocketEvent::HostResolved(info));
    assert_eq!(socket.state(), SocketState::Connected);
    assert_eq!(wire.lock().connects, vec![addr("10.0.0.7")]);
}

#[test]
fn test_abort_during_lookup_cancels_it() {
    let wire = SharedWire::default();
    let resolver = Arc::new(ScriptedResolver {
        deferred: true,
        ..ScriptedResolver::default()
    });
    let mut socket = AbstractSocket::tcp()
        .with_registry(mock_registry(&wire))
        .with_resolver(Arc::clone(&resolver) as Arc<dyn HostResolver>)
        .with_proxy(NetworkProxy::no_proxy());
    socket.connect_to_host("svc.local", 8080).unwrap();
    let (id, _) = resolver.started.lock()[0].clone();

    socket.abort();
    assert_eq!(socket.state(), SocketState::Unconnected);
    assert_eq!(*resolver.aborted.lock(), vec![id]);
    let notes = socket.take_notifications();
    assert_eq!(count(&notes, &SocketNotification::Disconnected), 0);
    assert_eq!(count(&notes, &SocketNotification::ReadChannelFinished), 0);
}

#[test]
fn test_abort_while_connecting_never_finishes_read_channel() {
    let wire = SharedWire::default();
    wire.lock()
        .connect_script
        .push_back(Ok(ConnectProgress::InProgress));
    let mut socket = tcp_socket(&wire);
    socket.connect_to_host("10.0.0.5", 80).unwrap();
    assert_eq!(socket.state(), SocketState::Connecting);
    socket.take_notifications();

    socket.abort();
    assert_eq!(socket.state(), SocketState::Unconnected);
    assert_eq!(
        socket.take_notifications(),
        vec![SocketNotification::StateChanged(SocketState::Unconnected)]
    );
}

#[test]
fn test_proxy_error_drops_remaining_candidates() {
    let wire = SharedWire::default();
    wire.lock()
        .connect_script
        .push_back(Err(SocketErrorKind::ProxyConnectionRefused));
    let mut resolver = ScriptedResolver::default();
    resolver
        .answers
        .insert("far".into(), vec![addr("10.0.0.5"), addr("10.0.0.6")]);
    let mut socket = socket_with(SocketType::Tcp, SocketConfig::default(), &wire, resolver);
    socket.connect_to_host("far", 80).unwrap();
    assert_eq!(wire.lock().connects.len(), 1);
    assert_eq!(socket.error_kind(), SocketErrorKind::ProxyConnectionRefused);
}

#[test]
fn test_proxy_error_on_notification_drops_candidates() {
    let wire = SharedWire::default();
    wire.lock()
        .connect_script
        .push_back(Ok(ConnectProgress::InProgress));
    wire.lock().on_notification = Some(Err(SocketErrorKind::ProxyAuthenticationRequired));
    let mut socket = tcp_socket(&wire);
    socket.connect_to_host("10.0.0.5", 80).unwrap();
    socket.advance(SocketEvent::Writable);
    assert_eq!(wire.lock().connects.len(), 1);
    assert_eq!(socket.state(), SocketState::Unconnected);
    assert_eq!(
        socket.error_kind(),
        SocketErrorKind::ProxyAuthenticationRequired
    );
}

#[test]
fn test_connect_timeout_tries_next_then_gives_up() {
    let wire = SharedWire::default();
    for _ in 0..2 {
        wire.lock()
            .connect_script
            .push_back(Ok(ConnectProgress::InProgress));
    }
    let mut socket = tcp_socket(&wire);
    socket.connect_to_host("10.0.0.5", 80).unwrap();

    socket.advance(SocketEvent::ConnectTimeout);
    assert_eq!(wire.lock().connects.len(), 2);
    assert_eq!(socket.state(), SocketState::Connecting);

    socket.advance(SocketEvent::ConnectTimeout);
    assert_eq!(socket.state(), SocketState::Unconnected);
    assert_eq!(socket.error_kind(), SocketErrorKind::SocketTimeout);
    assert!(socket.next_deadline().is_none());
}

#[test]
fn test_fire_due_timers_uses_deadline() {
    let wire = SharedWire::default();
    wire.lock()
        .connect_script
        .push_back(Ok(ConnectProgress::InProgress));
    let config = SocketConfig {
        retry_each_address: false,
        ..SocketConfig::default()
    };
    let mut socket = socket_with(SocketType::Tcp, config, &wire, ScriptedResolver::default());
    socket.connect_to_host("10.0.0.5", 80).unwrap();
    let deadline = socket.next_deadline().unwrap();

    assert!(!socket.fire_due_timers(Instant::now()));
    assert!(socket.fire_due_timers(deadline));
    assert_eq!(socket.error_kind(), SocketErrorKind::SocketTimeout);
}

#[test]
fn test_missing_engine_is_unsupported() {
    let registry = Arc::new(EngineRegistry::with_native_factory(|| None));
    let mut socket = AbstractSocket::tcp()
        .with_registry(registry)
        .with_proxy(NetworkProxy::no_proxy());
    socket.connect_to_host("10.0.0.5", 80).unwrap();
    assert_eq!(socket.state(), SocketState::Unconnected);
    assert_eq!(
        socket.error_kind(),
        SocketErrorKind::UnsupportedSocketOperation
    );
}

#[test]
fn test_no_usable_proxy_connects_directly() {
    let wire = SharedWire::default();
    let mut socket = AbstractSocket::tcp()
        .with_registry(mock_registry(&wire))
        .with_proxy_resolver(Arc::new(EmptyProxyResolver));
    socket.connect_to_host("10.0.0.5", 80).unwrap();
    assert_eq!(socket.state(), SocketState::Connected);
    assert_eq!(socket.proxy_in_use.proxy_type, ProxyType::NoProxy);
    assert_eq!(wire.lock().connects, vec![addr("10.0.0.5")]);
}

#[test]
fn test_udp_offered_only_http_proxy_connects_directly() {
    let wire = SharedWire::default();
    let mut socket = AbstractSocket::new(SocketType::Udp, SocketConfig::default())
        .with_registry(mock_registry(&wire))
        .with_proxy_resolver(Arc::new(StaticProxyResolver::new(vec![NetworkProxy::new(
            ProxyType::HttpProxy,
            "proxy",
            3128,
        )])));
    socket.connect_to_host("127.0.0.1", 5353).unwrap();

    let notes = socket.take_notifications();
    assert!(error_kinds(&notes).is_empty());
    assert_eq!(states(&notes)[0], SocketState::HostLookup);
    assert_eq!(socket.state(), SocketState::Connected);
    assert_eq!(socket.proxy_in_use.proxy_type, ProxyType::NoProxy);
    assert_eq!(wire.lock().connects, vec![addr("127.0.0.1")]);
}

#[test]
fn test_unresolved_default_proxy_is_rejected() {
    let wire = SharedWire::default();
    let mut socket = AbstractSocket::tcp()
        .with_registry(mock_registry(&wire))
        .with_proxy_resolver(Arc::new(StaticProxyResolver::new(vec![
            NetworkProxy::default(),
        ])));
    let err = socket.connect_to_host("10.0.0.5", 80).unwrap_err();
    assert_eq!(err.kind, SocketErrorKind::UnsupportedSocketOperation);
    assert_eq!(socket.state(), SocketState::Unconnected);
    assert!(wire.lock().connects.is_empty());
}

#[test]
fn test_cached_options_apply_to_new_engine() {
    let wire = SharedWire::default();
    let mut socket = tcp_socket(&wire);
    assert!(socket.set_socket_option(SocketOption::LowDelay, 1));
    assert!(socket.set_socket_option(SocketOption::KeepAlive, 1));
    assert!(socket.set_socket_option(SocketOption::LowDelay, 0));
    assert_eq!(socket.socket_option(SocketOption::LowDelay), Some(0));

    socket.connect_to_host("10.0.0.5", 80).unwrap();
    let options = wire.lock().options.clone();
    assert_eq!(
        options,
        vec![(SocketOption::LowDelay, 0), (SocketOption::KeepAlive, 1)]
    );
}

// ============================================================================
// Disconnecting
// ============================================================================

#[test]
fn test_pending_close_applies_after_connect() {
    let wire = SharedWire::default();
    wire.lock()
        .connect_script
        .push_back(Ok(ConnectProgress::InProgress));
    let mut socket = tcp_socket(&wire);
    socket.connect_to_host("10.0.0.5", 80).unwrap();
    socket.disconnect_from_host();
    assert_eq!(socket.state(), SocketState::Connecting);

    wire.lock().on_notification = Some(Ok(()));
    socket.advance(SocketEvent::Writable);
    assert_eq!(socket.state(), SocketState::Unconnected);
    let notes = socket.take_notifications();
    assert_eq!(
        states(&notes),
        vec![
            SocketState::HostLookup,
            SocketState::Connecting,
            SocketState::Connected,
            SocketState::Closing,
            SocketState::Unconnected
        ]
    );
    assert_eq!(count(&notes, &SocketNotification::Disconnected), 1);
}

#[test]
fn test_disconnect_flushes_before_closing() {
    let wire = SharedWire::default();
    let mut socket = connected_tcp(&wire);
    wire.lock().write_budget = Some(0);
    socket.write(b"hello").unwrap();
    socket.disconnect_from_host();
    assert_eq!(socket.state(), SocketState::Closing);
    assert!(socket.next_deadline().is_some());
    assert!(socket.interest().write);

    wire.lock().write_budget = None;
    socket.advance(SocketEvent::Writable);
    assert_eq!(socket.state(), SocketState::Unconnected);
    assert_eq!(wire.lock().written, b"hello");

    let notes = socket.take_notifications();
    assert_eq!(
        notes,
        vec![
            SocketNotification::StateChanged(SocketState::Closing),
            SocketNotification::BytesWritten(5),
            SocketNotification::ChannelBytesWritten {
                channel: 0,
                bytes: 5
            },
            SocketNotification::StateChanged(SocketState::Unconnected),
            SocketNotification::ReadChannelFinished,
            SocketNotification::Disconnected,
        ]
    );
    assert_eq!(socket.local_port(), 0);
    assert!(socket.peer_address().is_null());
}

#[test]
fn test_disconnect_timeout_forces_close() {
    let wire = SharedWire::default();
    let mut socket = connected_tcp(&wire);
    wire.lock().write_budget = Some(0);
    socket.write(b"stuck").unwrap();
    socket.disconnect_from_host();
    assert_eq!(socket.state(), SocketState::Closing);

    socket.advance(SocketEvent::DisconnectTimeout);
    assert_eq!(socket.state(), SocketState::Unconnected);
    assert_eq!(socket.bytes_to_write(), 0);
    assert!(socket
        .take_notifications()
        .contains(&SocketNotification::Disconnected));
}

#[test]
fn test_abort_bypasses_closing() {
    let wire = SharedWire::default();
    let mut socket = connected_tcp(&wire);
    wire.lock().write_budget = Some(0);
    socket.write(b"never sent").unwrap();

    socket.abort();
    assert_eq!(socket.state(), SocketState::Unconnected);
    assert_eq!(socket.bytes_to_write(), 0);
    let notes = socket.take_notifications();
    assert_eq!(states(&notes), vec![SocketState::Unconnected]);
    assert_eq!(count(&notes, &SocketNotification::Disconnected), 1);
    assert!(wire.lock().written.is_empty());
    assert_eq!(wire.lock().closed, 1);
}

#[test]
fn test_disconnect_from_bound_reports_no_error() {
    let wire = SharedWire::default();
    let mut socket = tcp_socket(&wire);
    socket
        .bind(&addr("10.0.0.1"), 0, BindMode::DEFAULT_FOR_PLATFORM)
        .unwrap();
    socket.disconnect_from_host();
    assert_eq!(socket.state(), SocketState::Unconnected);
    assert!(error_kinds(&socket.take_notifications()).is_empty());
}

// ============================================================================
// Buffered I/O
// ============================================================================

#[test]
fn test_ready_read_is_coalesced_until_drained() {
    let wire = SharedWire::default();
    let mut socket = connected_tcp(&wire);
    wire.lock().incoming.push_back(b"abc".to_vec());
    socket.advance(SocketEvent::Readable);
    wire.lock().incoming.push_back(b"def".to_vec());
    socket.advance(SocketEvent::Readable);

    let notes = socket.take_notifications();
    assert_eq!(count(&notes, &SocketNotification::ReadyRead), 1);
    assert_eq!(count(&notes, &SocketNotification::ChannelReadyRead(0)), 2);
    assert_eq!(socket.bytes_available(), 6);
    assert_eq!(&socket.read_all().unwrap()[..], b"abcdef");

    wire.lock().incoming.push_back(b"g".to_vec());
    socket.advance(SocketEvent::Readable);
    assert_eq!(
        count(&socket.take_notifications(), &SocketNotification::ReadyRead),
        1
    );
}

#[test]
fn test_read_buffer_cap_pauses_and_resumes() {
    let wire = SharedWire::default();
    let mut socket = connected_tcp(&wire);
    socket.set_read_buffer_size(4);
    wire.lock().incoming.push_back(b"0123456789".to_vec());

    socket.advance(SocketEvent::Readable);
    assert_eq!(socket.bytes_available(), 4);
    assert!(socket.interest().read);

    socket.advance(SocketEvent::Readable);
    assert_eq!(socket.bytes_available(), 4);
    assert!(!socket.interest().read);

    let mut buf = [0u8; 4];
    assert_eq!(socket.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"0123");
    assert!(socket.interest().read);
}

#[test]
fn test_peek_and_read_line() {
    let wire = SharedWire::default();
    let mut socket = connected_tcp(&wire);
    wire.lock().incoming.push_back(b"GET / HTTP/1.1\r\nHost".to_vec());
    socket.advance(SocketEvent::Readable);

    let mut head = [0u8; 3];
    assert_eq!(socket.peek(&mut head), 3);
    assert_eq!(&head, b"GET");
    assert!(socket.can_read_line());
    assert_eq!(&socket.read_line(1024).unwrap()[..], b"GET / HTTP/1.1\r\n");
    assert!(!socket.can_read_line());
    assert_eq!(socket.bytes_available(), 4);
}

#[test]
fn test_remote_close_reports_and_disconnects() {
    let wire = SharedWire::default();
    let mut socket = connected_tcp(&wire);
    wire.lock().incoming.push_back(b"bye".to_vec());
    wire.lock().incoming.push_back(Vec::new());
    socket.advance(SocketEvent::Readable);
    socket.advance(SocketEvent::Readable);

    assert_eq!(socket.state(), SocketState::Unconnected);
    let notes = socket.take_notifications();
    assert_eq!(error_kinds(&notes), vec![SocketErrorKind::RemoteHostClosed]);
    assert_eq!(count(&notes, &SocketNotification::Disconnected), 1);
    // Data received before the close stays readable.
    assert_eq!(&socket.read_all().unwrap()[..], b"bye");
}

#[test]
fn test_remote_close_reports_error_after_state_change() {
    let wire = SharedWire::default();
    let mut socket = connected_tcp(&wire);
    wire.lock().incoming.push_back(Vec::new());
    socket.advance(SocketEvent::Readable);

    let mut notes = socket.take_notifications();
    let last = notes.pop();
    assert!(matches!(
        last,
        Some(SocketNotification::ErrorOccurred(ref e)) if e.kind == SocketErrorKind::RemoteHostClosed
    ));
    assert_eq!(
        notes,
        vec![
            SocketNotification::StateChanged(SocketState::Closing),
            SocketNotification::StateChanged(SocketState::Unconnected),
            SocketNotification::ReadChannelFinished,
            SocketNotification::Disconnected,
        ]
    );
    assert_eq!(socket.error_kind(), SocketErrorKind::RemoteHostClosed);
}

#[test]
fn test_partial_writes_drain_over_several_notifications() {
    let wire = SharedWire::default();
    let mut socket = connected_tcp(&wire);
    wire.lock().write_budget = Some(3);
    assert_eq!(socket.write(b"abcdefgh").unwrap(), 8);
    assert_eq!(socket.bytes_to_write(), 8);

    socket.advance(SocketEvent::Writable);
    assert_eq!(socket.bytes_to_write(), 5);
    assert!(socket.interest().write);

    wire.lock().write_budget = None;
    assert!(socket.flush());
    assert_eq!(socket.bytes_to_write(), 0);
    assert!(!socket.interest().write);
    assert_eq!(wire.lock().written, b"abcdefgh");

    let notes = socket.take_notifications();
    assert_eq!(count(&notes, &SocketNotification::BytesWritten(3)), 1);
    assert_eq!(count(&notes, &SocketNotification::BytesWritten(5)), 1);
}

#[test]
fn test_write_before_connect_is_rejected() {
    let wire = SharedWire::default();
    let mut socket = tcp_socket(&wire);
    assert!(socket.write(b"x").is_err());
    assert_eq!(socket.error_kind(), SocketErrorKind::Unknown);
}

#[test]
fn test_channel_selection_bounds() {
    let wire = SharedWire::default();
    let mut socket = connected_tcp(&wire);
    assert!(socket.set_current_read_channel(0).is_ok());
    assert!(socket.set_current_read_channel(1).is_err());
    assert!(socket.set_current_write_channel(3).is_err());
}

#[test]
fn test_adopted_descriptor_is_connected() {
    let wire = SharedWire::default();
    let mut socket = tcp_socket(&wire);
    socket
        .set_socket_descriptor(7, SocketState::Connected)
        .unwrap();
    assert_eq!(socket.state(), SocketState::Connected);
    assert_eq!(socket.descriptor(), Some(7));
    assert_eq!(socket.read_channel_count(), 1);
    assert!(socket.interest().read);
}

#[test]
fn test_adopted_descriptor_after_abort_flushes_on_disconnect() {
    let wire = SharedWire::default();
    let mut socket = connected_tcp(&wire);
    socket.abort();
    assert_eq!(socket.state(), SocketState::Unconnected);

    socket
        .set_socket_descriptor(7, SocketState::Connected)
        .unwrap();
    wire.lock().write_budget = Some(0);
    socket.write(b"pending").unwrap();
    socket.take_notifications();

    socket.disconnect_from_host();
    assert_eq!(socket.state(), SocketState::Closing);
    assert_eq!(socket.bytes_to_write(), 7);
    assert_eq!(
        states(&socket.take_notifications()),
        vec![SocketState::Closing]
    );
}

#[test]
fn test_bind_after_abort_clears_abort() {
    let wire = SharedWire::default();
    let mut socket = connected_tcp(&wire);
    socket.abort();
    socket
        .bind(&addr("10.0.0.1"), 0, BindMode::DEFAULT_FOR_PLATFORM)
        .unwrap();
    assert!(!socket.abort_called);
    assert!(!socket.pending_close);
}

// ============================================================================
// UDP
// ============================================================================

#[test]
fn test_udp_bind_enables_reads_and_sets_reuse() {
    let wire = SharedWire::default();
    let mut socket = socket_with(
        SocketType::Udp,
        SocketConfig::default(),
        &wire,
        ScriptedResolver::default(),
    );
    assert!(!socket.is_buffered());
    socket
        .bind(&addr("10.0.0.1"), 9000, BindMode::SHARE_ADDRESS)
        .unwrap();
    assert_eq!(socket.state(), SocketState::Bound);
    assert_eq!(socket.local_port(), 9000);
    assert!(socket.interest().read);
    assert!(wire
        .lock()
        .options
        .contains(&(SocketOption::AddressReusable, 1)));

    // Unbuffered: the first notification signals, the second pauses.
    socket.advance(SocketEvent::Readable);
    assert!(socket.interest().read);
    socket.advance(SocketEvent::Readable);
    assert!(!socket.interest().read);
    assert_eq!(
        count(&socket.take_notifications(), &SocketNotification::ReadyRead),
        1
    );
}

#[test]
fn test_udp_send_binds_implicitly() {
    let wire = SharedWire::default();
    let mut socket = socket_with(
        SocketType::Udp,
        SocketConfig::default(),
        &wire,
        ScriptedResolver::default(),
    );
    let header = IpPacketHeader::to(addr("10.0.0.9"), 5353);
    assert_eq!(socket.send_datagram(b"query", &header).unwrap(), 5);
    assert_eq!(socket.state(), SocketState::Bound);
    let sent = wire.lock().sent_datagrams.clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.destination_port, 5353);
    assert!(socket
        .take_notifications()
        .contains(&SocketNotification::BytesWritten(5)));
}

#[test]
fn test_udp_receive_requires_bound_socket() {
    let wire = SharedWire::default();
    let mut socket = socket_with(
        SocketType::Udp,
        SocketConfig::default(),
        &wire,
        ScriptedResolver::default(),
    );
    let err = socket.receive_datagram(Some(16)).unwrap_err();
    assert_eq!(err.kind, SocketErrorKind::OperationError);
}

// ============================================================================
// SCTP datagram mode
// ============================================================================

fn connected_sctp(wire: &SharedWire, streams: i32) -> AbstractSocket {
    wire.lock().streams = (streams, streams);
    let mut socket = socket_with(
        SocketType::Sctp,
        SocketConfig::default(),
        wire,
        ScriptedResolver::default(),
    );
    socket.connect_to_host("10.0.0.5", 3868).unwrap();
    assert_eq!(socket.state(), SocketState::Connected);
    socket.take_notifications();
    socket
}

fn fragment(data: &[u8], stream: i32, end_of_record: bool) -> (Vec<u8>, IpPacketHeader) {
    let mut header = IpPacketHeader::default();
    header.stream_number = stream;
    header.end_of_record = end_of_record;
    (data.to_vec(), header)
}

#[test]
fn test_sctp_channels_follow_stream_counts() {
    let wire = SharedWire::default();
    let socket = connected_sctp(&wire, 3);
    assert!(socket.is_datagram_mode());
    assert_eq!(socket.read_channel_count(), 3);
    assert_eq!(socket.write_channel_count(), 3);
}

#[test]
fn test_sctp_stream_mode_uses_one_channel() {
    let wire = SharedWire::default();
    wire.lock().streams = (4, 4);
    let config = SocketConfig {
        max_channel_count: -1,
        ..SocketConfig::default()
    };
    let mut socket = socket_with(SocketType::Sctp, config, &wire, ScriptedResolver::default());
    socket.connect_to_host("10.0.0.5", 3868).unwrap();
    assert!(!socket.is_datagram_mode());
    assert_eq!(socket.read_channel_count(), 1);
    assert!(wire.lock().options.contains(&(SocketOption::MaxStreams, 1)));
}

#[test]
fn test_sctp_writes_round_robin_across_channels() {
    let wire = SharedWire::default();
    let mut socket = connected_sctp(&wire, 2);

    socket
        .write_datagram(NetworkDatagram::new(&b"a0"[..], IpPacketHeader::default()))
        .unwrap();
    socket
        .write_datagram(NetworkDatagram::new(&b"a1"[..], IpPacketHeader::default()))
        .unwrap();
    socket.set_current_write_channel(1).unwrap();
    socket
        .write_datagram(NetworkDatagram::new(&b"b0"[..], IpPacketHeader::default()))
        .unwrap();

    assert!(socket.flush());
    let sent: Vec<(Vec<u8>, i32)> = wire
        .lock()
        .sent_datagrams
        .iter()
        .map(|(d, h)| (d.clone(), h.stream_number))
        .collect();
    assert_eq!(
        sent,
        vec![
            (b"a0".to_vec(), 0),
            (b"b0".to_vec(), 1),
            (b"a1".to_vec(), 0)
        ]
    );

    let notes = socket.take_notifications();
    let per_channel: Vec<&SocketNotification> = notes
        .iter()
        .filter(|n| matches!(n, SocketNotification::ChannelBytesWritten { .. }))
        .collect();
    assert_eq!(per_channel.len(), 3);
    // Only the current write channel reports plain BytesWritten.
    assert_eq!(count(&notes, &SocketNotification::BytesWritten(2)), 1);
    assert!(!socket.interest().write);
}

#[test]
fn test_sctp_fragments_reassemble_into_one_message() {
    let wire = SharedWire::default();
    let mut socket = connected_sctp(&wire, 2);
    wire.lock()
        .incoming_datagrams
        .extend([fragment(b"hel", 1, false), fragment(b"lo", 1, true)]);

    socket.advance(SocketEvent::Readable);
    let notes = socket.take_notifications();
    assert_eq!(count(&notes, &SocketNotification::ChannelReadyRead(1)), 1);
    assert_eq!(count(&notes, &SocketNotification::ReadyRead), 0);

    assert!(socket.read_datagram().is_none());
    socket.set_current_read_channel(1).unwrap();
    let datagram = socket.read_datagram().unwrap();
    assert_eq!(&datagram.data[..], b"hello");
    assert_eq!(datagram.header.stream_number, 1);
}

#[test]
fn test_sctp_partial_message_survives_would_block() {
    let wire = SharedWire::default();
    let mut socket = connected_sctp(&wire, 1);
    wire.lock()
        .incoming_datagrams
        .push_back(fragment(b"part-", 0, false));
    socket.advance(SocketEvent::Readable);
    assert!(socket.read_datagram().is_none());

    wire.lock()
        .incoming_datagrams
        .push_back(fragment(b"two", 0, true));
    socket.advance(SocketEvent::Readable);
    assert_eq!(&socket.read_datagram().unwrap().data[..], b"part-two");
}

#[test]
fn test_sctp_unknown_stream_is_dropped() {
    let wire = SharedWire::default();
    let mut socket = connected_sctp(&wire, 2);
    wire.lock()
        .incoming_datagrams
        .extend([fragment(b"lost", 5, true), fragment(b"kept", 0, true)]);
    socket.advance(SocketEvent::Readable);
    assert_eq!(&socket.read_datagram().unwrap().data[..], b"kept");
    assert!(socket.read_datagram().is_none());
}

#[test]
fn test_sctp_generic_read_consumes_one_message() {
    let wire = SharedWire::default();
    let mut socket = connected_sctp(&wire, 1);
    wire.lock()
        .incoming_datagrams
        .extend([fragment(b"0123456789", 0, true), fragment(b"next", 0, true)]);
    socket.advance(SocketEvent::Readable);

    let mut buf = [0u8; 4];
    assert_eq!(socket.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"0123");
    let next = socket.read_datagram().unwrap();
    assert_eq!(&next.data[..], b"next");
}

#[test]
fn test_sctp_empty_receive_is_remote_close() {
    let wire = SharedWire::default();
    let mut socket = connected_sctp(&wire, 1);
    wire.lock()
        .incoming_datagrams
        .push_back(fragment(b"", 0, true));
    socket.advance(SocketEvent::Readable);
    assert_eq!(socket.state(), SocketState::Unconnected);
    let notes = socket.take_notifications();
    assert_eq!(error_kinds(&notes), vec![SocketErrorKind::RemoteHostClosed]);
    let disconnected = notes
        .iter()
        .position(|n| *n == SocketNotification::Disconnected);
    let error = notes
        .iter()
        .position(|n| matches!(n, SocketNotification::ErrorOccurred(_)));
    assert!(disconnected.is_some());
    assert!(disconnected < error);
}

#[test]
fn test_sctp_zero_length_message_delays_close() {
    let wire = SharedWire::default();
    let mut socket = connected_sctp(&wire, 1);
    wire.lock().write_budget = Some(0);
    socket
        .write_datagram(NetworkDatagram::new(&b""[..], IpPacketHeader::default()))
        .unwrap();

    socket.disconnect_from_host();
    assert_eq!(socket.state(), SocketState::Closing);
    assert!(wire.lock().sent_datagrams.is_empty());

    wire.lock().write_budget = None;
    socket.advance(SocketEvent::Writable);
    assert_eq!(socket.state(), SocketState::Unconnected);
    let sent = wire.lock().sent_datagrams.clone();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.is_empty());
}

#[test]
fn test_sctp_channel_count_locked_after_connect() {
    let wire = SharedWire::default();
    let mut socket = connected_sctp(&wire, 1);
    let err = socket.set_max_channel_count(-1).unwrap_err();
    assert_eq!(err.kind, SocketErrorKind::OperationError);
    assert!(socket.is_datagram_mode());
}
