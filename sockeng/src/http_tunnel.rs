//! TCP tunnelling through an HTTP proxy with `CONNECT`.
//!
//! The engine owns a transport engine connected to the proxy and walks it
//! through the handshake:
//!
//! ```text
//! Idle -> ConnectingToProxy -> RequestSent -> Tunnelled
//! ```
//!
//! Once tunnelled, reads and writes pass straight through. Bytes the proxy
//! sent after its response header are handed out before anything else.
//! Failures before the tunnel is up are reported as proxy errors.

use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Buf, BytesMut};
use sockeng_addr::{HostAddress, NetworkLayerProtocol};
use tracing::{debug, trace, warn};

use crate::dns::{next_lookup_id, resolve_now};
use crate::engine::{
    wrong_state, ConnectProgress, EngineState, Interest, RawDescriptor, Readiness, SocketEngine,
    SocketState, SocketType, Transfer,
};
use crate::error::{Result, SocketError, SocketErrorKind as Kind};
use crate::proxy::{NetworkProxy, ProxyType};
use crate::registry::EngineHandler;

const USER_AGENT: &str = concat!("sockeng/", env!("CARGO_PKG_VERSION"));

/// Largest response header accepted from a proxy.
const MAX_RESPONSE_HEADER: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelState {
    Idle,
    ConnectingToProxy,
    RequestSent,
    Tunnelled,
}

/// Engine speaking to the target through an HTTP `CONNECT` tunnel.
#[derive(Debug)]
pub struct HttpSocketEngine {
    base: EngineState,
    proxy: NetworkProxy,
    transport: Option<Box<dyn SocketEngine>>,
    tunnel: TunnelState,
    initialized: bool,
    target_host: String,
    target_port: u16,
    request: BytesMut,
    response: BytesMut,
    leftover: BytesMut,
}

impl HttpSocketEngine {
    /// Tunnel engine using a native socket to reach `proxy`.
    pub fn new(proxy: NetworkProxy) -> Self {
        Self::with_transport(proxy, native_transport())
    }

    /// Tunnel engine using `transport` to reach the proxy.
    pub fn with_transport(proxy: NetworkProxy, transport: Option<Box<dyn SocketEngine>>) -> Self {
        Self {
            base: EngineState::default(),
            proxy,
            transport,
            tunnel: TunnelState::Idle,
            initialized: false,
            target_host: String::new(),
            target_port: 0,
            request: BytesMut::new(),
            response: BytesMut::new(),
            leftover: BytesMut::new(),
        }
    }

    pub fn proxy(&self) -> &NetworkProxy {
        &self.proxy
    }

    fn reset_tunnel(&mut self) {
        self.tunnel = TunnelState::Idle;
        self.request.clear();
        self.response.clear();
        self.leftover.clear();
    }

    /// Record `err` and drop back to unconnected.
    fn abort_handshake(&mut self, err: SocketError) -> SocketError {
        debug!(proxy = %self.proxy.host_name, error = %err, "proxy handshake failed");
        if let Some(transport) = self.transport.as_mut() {
            transport.close();
        }
        self.reset_tunnel();
        self.base.state = SocketState::Unconnected;
        self.base.fail(err)
    }

    fn transport_error(&self) -> SocketError {
        let err = self
            .transport
            .as_ref()
            .map(|t| t.error())
            .unwrap_or_else(|| SocketError::from_kind(Kind::Unknown));
        proxy_transport_error(err)
    }

    fn start_proxy_connection(&mut self) -> Result<ConnectProgress> {
        let lookup = resolve_now(next_lookup_id(), &self.proxy.host_name);
        let Some(address) = lookup.addresses.first().cloned() else {
            let err = SocketError::new(Kind::ProxyNotFound, "Proxy host not found");
            return Err(self.abort_handshake(err));
        };
        let Some(transport) = self.transport.as_mut() else {
            return Err(self.abort_handshake(SocketError::from_kind(
                Kind::UnsupportedSocketOperation,
            )));
        };

        let protocol = match address.protocol() {
            NetworkLayerProtocol::Ipv6 => NetworkLayerProtocol::Ipv6,
            _ => NetworkLayerProtocol::Ipv4,
        };
        if let Err(e) = transport.initialize(SocketType::Tcp, protocol) {
            return Err(self.abort_handshake(proxy_transport_error(e)));
        }

        debug!(proxy = %address, port = self.proxy.port, target = %self.target_host, "connecting to proxy");
        self.base.state = SocketState::Connecting;
        match transport.connect_to_host(&address, self.proxy.port) {
            Ok(ConnectProgress::Connected) => {
                self.send_request();
                self.pump();
                self.progress()
            }
            Ok(ConnectProgress::InProgress) => {
                self.tunnel = TunnelState::ConnectingToProxy;
                Ok(ConnectProgress::InProgress)
            }
            Err(e) => Err(self.abort_handshake(proxy_transport_error(e))),
        }
    }

    fn progress(&mut self) -> Result<ConnectProgress> {
        match self.base.state {
            SocketState::Connected => Ok(ConnectProgress::Connected),
            SocketState::Connecting => Ok(ConnectProgress::InProgress),
            _ => Err(self.error()),
        }
    }

    fn send_request(&mut self) {
        self.request = BytesMut::from(
            build_connect_request(&self.target_host, self.target_port, &self.proxy).as_slice(),
        );
        self.response.clear();
        self.tunnel = TunnelState::RequestSent;
        trace!(bytes = self.request.len(), "CONNECT request queued");
    }

    /// Push the handshake as far as the transport allows.
    fn pump(&mut self) {
        if self.tunnel == TunnelState::ConnectingToProxy {
            let Some(transport) = self.transport.as_mut() else {
                return;
            };
            match transport.connection_notification() {
                SocketState::Connected => self.send_request(),
                SocketState::Connecting => return,
                _ => {
                    let err = self.transport_error();
                    self.abort_handshake(err);
                    return;
                }
            }
        }
        if self.tunnel != TunnelState::RequestSent {
            return;
        }

        if let Err(err) = self.flush_request() {
            self.abort_handshake(err);
            return;
        }
        match self.read_response() {
            Ok(true) => self.finish_handshake(),
            Ok(false) => {}
            Err(err) => {
                self.abort_handshake(err);
            }
        }
    }

    fn flush_request(&mut self) -> std::result::Result<(), SocketError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(SocketError::from_kind(Kind::UnsupportedSocketOperation));
        };
        while !self.request.is_empty() {
            match transport.write(&self.request) {
                Ok(Transfer::Done(n)) => self.request.advance(n),
                Ok(Transfer::WouldBlock) => break,
                Err(e) => return Err(proxy_transport_error(e)),
            }
        }
        Ok(())
    }

    /// Read response bytes; true once the full header has arrived.
    fn read_response(&mut self) -> std::result::Result<bool, SocketError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(SocketError::from_kind(Kind::UnsupportedSocketOperation));
        };
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if header_end(&self.response).is_some() {
                return Ok(true);
            }
            if self.response.len() > MAX_RESPONSE_HEADER {
                return Err(SocketError::new(
                    Kind::ProxyProtocol,
                    "Proxy response header too large",
                ));
            }
            match transport.read(&mut buf) {
                Ok(Transfer::Done(0)) => {
                    return Err(SocketError::from_kind(Kind::ProxyConnectionClosed))
                }
                Ok(Transfer::Done(n)) => self.response.extend_from_slice(&buf[..n]),
                Ok(Transfer::WouldBlock) => return Ok(false),
                Err(e) => return Err(proxy_transport_error(e)),
            }
        }
    }

    fn finish_handshake(&mut self) {
        let Some(end) = header_end(&self.response) else {
            return;
        };
        let status = parse_status_line(&self.response[..end]);
        match status.map(map_status) {
            Some(Ok(())) => {
                let mut response = std::mem::take(&mut self.response);
                let _ = response.split_to(end);
                self.leftover = response;
                self.tunnel = TunnelState::Tunnelled;
                self.base.state = SocketState::Connected;
                self.base.inbound_stream_count = 1;
                self.base.outbound_stream_count = 1;
                if let Some(transport) = self.transport.as_ref() {
                    self.base.local_address = transport.local_address();
                    self.base.local_port = transport.local_port();
                }
                self.base.clear_error();
                debug!(
                    target = %self.target_host,
                    port = self.target_port,
                    leftover = self.leftover.len(),
                    "proxy tunnel established"
                );
            }
            Some(Err(err)) => {
                self.abort_handshake(err);
            }
            None => {
                warn!("malformed proxy response");
                self.abort_handshake(SocketError::new(
                    Kind::ProxyProtocol,
                    "Invalid HTTP response from proxy",
                ));
            }
        }
    }

    fn handshake_interest(&self) -> Interest {
        match self.tunnel {
            TunnelState::ConnectingToProxy => Interest {
                write: true,
                ..Interest::default()
            },
            TunnelState::RequestSent => Interest {
                read: true,
                write: !self.request.is_empty(),
                exception: false,
            },
            _ => Interest::default(),
        }
    }
}

fn native_transport() -> Option<Box<dyn SocketEngine>> {
    #[cfg(unix)]
    {
        Some(Box::new(crate::native::NativeSocketEngine::new()))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Transport failures before the tunnel is up, seen from the socket's side.
fn proxy_transport_error(err: SocketError) -> SocketError {
    let kind = match err.kind {
        Kind::ConnectionRefused => Kind::ProxyConnectionRefused,
        Kind::RemoteHostClosed => Kind::ProxyConnectionClosed,
        Kind::SocketTimeout => Kind::ProxyConnectionTimeout,
        Kind::HostNotFound => Kind::ProxyNotFound,
        other => return SocketError::new(other, err.message),
    };
    SocketError::from_kind(kind)
}

/// The `CONNECT` request for `host:port`, with credentials when configured.
pub(crate) fn build_connect_request(host: &str, port: u16, proxy: &NetworkProxy) -> Vec<u8> {
    let authority = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let mut request = format!("CONNECT {} HTTP/1.1\r\n", authority);
    request.push_str("Proxy-Connection: keep-alive\r\n");
    request.push_str(&format!("Host: {}\r\n", authority));
    request.push_str(&format!("User-Agent: {}\r\n", USER_AGENT));
    if let Some(user) = proxy.user.as_deref() {
        let credentials = format!("{}:{}", user, proxy.password.as_deref().unwrap_or(""));
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            STANDARD.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    request.into_bytes()
}

/// Offset just past the blank line ending the response header.
fn header_end(response: &[u8]) -> Option<usize> {
    response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Status code from `HTTP/1.x NNN reason`.
pub(crate) fn parse_status_line(header: &[u8]) -> Option<u16> {
    let line_end = header.iter().position(|b| *b == b'\r' || *b == b'\n')?;
    let line = std::str::from_utf8(&header[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let code = parts.next()?;
    if code.len() != 3 {
        return None;
    }
    code.parse().ok()
}

/// What a proxy status code means for the tunnel.
pub(crate) fn map_status(code: u16) -> std::result::Result<(), SocketError> {
    match code {
        200 => Ok(()),
        407 => Err(SocketError::from_kind(Kind::ProxyAuthenticationRequired)),
        403 | 405 => Err(SocketError::new(Kind::SocketAccess, "Proxy denied connection")),
        404 => Err(SocketError::from_kind(Kind::HostNotFound)),
        503 => Err(SocketError::from_kind(Kind::ConnectionRefused)),
        other => Err(SocketError::new(
            Kind::ProxyProtocol,
            format!("Error communicating with HTTP proxy (status {})", other),
        )),
    }
}

impl SocketEngine for HttpSocketEngine {
    fn base(&self) -> &EngineState {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EngineState {
        &mut self.base
    }

    fn initialize(&mut self, socket_type: SocketType, protocol: NetworkLayerProtocol) -> Result<()> {
        if socket_type != SocketType::Tcp {
            return Err(self.unsupported("initialize"));
        }
        self.close();
        self.base.clear_error();
        self.base.socket_type = socket_type;
        self.base.protocol = protocol;
        self.initialized = true;
        Ok(())
    }

    fn initialize_from_descriptor(&mut self, _: RawDescriptor, _: SocketState) -> Result<()> {
        Err(self.unsupported("initialize_from_descriptor"))
    }

    fn descriptor(&self) -> Option<RawDescriptor> {
        self.transport.as_ref().and_then(|t| t.descriptor())
    }

    fn is_valid(&self) -> bool {
        self.initialized
    }

    fn connect_to_host(&mut self, address: &HostAddress, port: u16) -> Result<ConnectProgress> {
        let progress = self.connect_to_host_by_name(&address.to_string(), port);
        self.base.peer_address = address.clone();
        progress
    }

    fn connect_to_host_by_name(&mut self, name: &str, port: u16) -> Result<ConnectProgress> {
        match self.tunnel {
            TunnelState::Tunnelled => Ok(ConnectProgress::Connected),
            TunnelState::ConnectingToProxy | TunnelState::RequestSent => {
                self.pump();
                self.progress()
            }
            TunnelState::Idle => {
                if !self.initialized {
                    return Err(self.unsupported("connect_to_host_by_name"));
                }
                if !matches!(self.base.state, SocketState::Unconnected | SocketState::Connecting) {
                    return Err(wrong_state(&mut self.base, "connect_to_host_by_name"));
                }
                self.target_host = name.to_string();
                self.target_port = port;
                self.base.peer_address = HostAddress::parse(name).unwrap_or_default();
                self.base.peer_port = port;
                self.start_proxy_connection()
            }
        }
    }

    fn connection_notification(&mut self) -> SocketState {
        if matches!(
            self.tunnel,
            TunnelState::ConnectingToProxy | TunnelState::RequestSent
        ) {
            self.pump();
        }
        self.base.state
    }

    fn bind(&mut self, _: &HostAddress, _: u16) -> Result<()> {
        Err(self.unsupported("bind"))
    }

    fn close(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.close();
        }
        self.reset_tunnel();
        self.base.state = SocketState::Unconnected;
        self.base.reset_connection();
        self.base.read_notification = false;
        self.base.write_notification = false;
        self.base.exception_notification = false;
    }

    fn bytes_available(&self) -> usize {
        if self.tunnel != TunnelState::Tunnelled {
            return 0;
        }
        self.leftover.len() + self.transport.as_ref().map_or(0, |t| t.bytes_available())
    }

    fn bytes_to_write(&self) -> usize {
        self.request.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        if self.tunnel != TunnelState::Tunnelled {
            return Err(wrong_state(&mut self.base, "read"));
        }
        if !self.leftover.is_empty() {
            let n = buf.len().min(self.leftover.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.advance(n);
            return Ok(Transfer::Done(n));
        }
        let Some(transport) = self.transport.as_mut() else {
            return Err(self.unsupported("read"));
        };
        match transport.read(buf) {
            Ok(transfer) => Ok(transfer),
            Err(err) => {
                self.reset_tunnel();
                self.base.state = SocketState::Unconnected;
                Err(self.base.fail(err))
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<Transfer> {
        if self.tunnel != TunnelState::Tunnelled {
            return Err(wrong_state(&mut self.base, "write"));
        }
        let Some(transport) = self.transport.as_mut() else {
            return Err(self.unsupported("write"));
        };
        match transport.write(data) {
            Ok(transfer) => Ok(transfer),
            Err(err) => {
                if !transport.is_valid() || transport.state() == SocketState::Unconnected {
                    self.reset_tunnel();
                    self.base.state = SocketState::Unconnected;
                }
                Err(self.base.fail(err))
            }
        }
    }

    fn interest(&self) -> Interest {
        match self.tunnel {
            TunnelState::ConnectingToProxy | TunnelState::RequestSent => self.handshake_interest(),
            _ => Interest {
                read: self.base.read_notification,
                write: self.base.write_notification,
                exception: self.base.exception_notification,
            },
        }
    }

    fn wait_for_read_or_write(
        &mut self,
        check_read: bool,
        check_write: bool,
        deadline: Option<Instant>,
    ) -> Result<Readiness> {
        if self.tunnel == TunnelState::Tunnelled && check_read && !self.leftover.is_empty() {
            return Ok(Readiness {
                readable: true,
                ..Readiness::default()
            });
        }

        let handshaking = matches!(
            self.tunnel,
            TunnelState::ConnectingToProxy | TunnelState::RequestSent
        );
        let (read, write) = if handshaking {
            let interest = self.handshake_interest();
            (interest.read, interest.write)
        } else {
            (check_read, check_write)
        };

        let Some(transport) = self.transport.as_mut() else {
            return Err(self.unsupported("wait_for_read_or_write"));
        };
        let ready = transport.wait_for_read_or_write(read, write, deadline)?;
        if ready.timed_out {
            self.base.fail_with(Kind::SocketTimeout, "Network operation timed out");
            return Ok(ready);
        }
        if handshaking {
            // Any handshake progress is reported as whatever the caller waits for.
            let woke = ready.readable || ready.writable;
            return Ok(Readiness {
                readable: check_read && woke,
                writable: check_write && woke,
                timed_out: false,
            });
        }
        Ok(ready)
    }
}

/// Creates [`HttpSocketEngine`]s for TCP sockets behind an HTTP proxy.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpSocketEngineHandler;

impl EngineHandler for HttpSocketEngineHandler {
    fn name(&self) -> &str {
        "http-connect"
    }

    fn create_engine(
        &self,
        socket_type: SocketType,
        proxy: &NetworkProxy,
    ) -> Option<Box<dyn SocketEngine>> {
        if socket_type != SocketType::Tcp || proxy.proxy_type != ProxyType::HttpProxy {
            return None;
        }
        Some(Box::new(HttpSocketEngine::new(proxy.clone())))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    // ========================================================================
    // Request building and status mapping
    // ========================================================================

    #[test]
    fn test_connect_request_without_credentials() {
        let proxy = NetworkProxy::new(ProxyType::HttpProxy, "proxy", 3128);
        let request = String::from_utf8(build_connect_request("example.com", 443, &proxy)).unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:443\r\n"));
        assert!(request.contains("Proxy-Connection: keep-alive\r\n"));
        assert!(!request.contains("Proxy-Authorization"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_connect_request_brackets_ipv6_and_adds_auth() {
        let proxy = NetworkProxy::new(ProxyType::HttpProxy, "proxy", 3128)
            .with_credentials("alice", "s3cret");
        let request = String::from_utf8(build_connect_request("2001:db8::1", 80, &proxy)).unwrap();
        assert!(request.starts_with("CONNECT [2001:db8::1]:80 HTTP/1.1\r\n"));
        let expected = STANDARD.encode("alice:s3cret");
        assert!(request.contains(&format!("Proxy-Authorization: Basic {}\r\n", expected)));
    }

    #[test]
    fn test_status_line_parsing() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 Connection established\r\n"), Some(200));
        assert_eq!(parse_status_line(b"HTTP/1.0 407 Auth\r\n"), Some(407));
        assert_eq!(parse_status_line(b"SSH-2.0-OpenSSH\r\n"), None);
        assert_eq!(parse_status_line(b"HTTP/1.1 20\r\n"), None);
        assert_eq!(parse_status_line(b"HTTP/1.1 200"), None);
    }

    #[test]
    fn test_status_mapping() {
        let kind = |code| map_status(code).unwrap_err().kind;
        assert!(map_status(200).is_ok());
        assert_eq!(kind(407), Kind::ProxyAuthenticationRequired);
        assert_eq!(kind(403), Kind::SocketAccess);
        assert_eq!(kind(405), Kind::SocketAccess);
        assert_eq!(kind(404), Kind::HostNotFound);
        assert_eq!(kind(503), Kind::ConnectionRefused);
        assert_eq!(kind(502), Kind::ProxyProtocol);
    }

    #[test]
    fn test_transport_errors_become_proxy_errors() {
        let map = |kind| proxy_transport_error(SocketError::from_kind(kind)).kind;
        assert_eq!(map(Kind::ConnectionRefused), Kind::ProxyConnectionRefused);
        assert_eq!(map(Kind::RemoteHostClosed), Kind::ProxyConnectionClosed);
        assert_eq!(map(Kind::SocketTimeout), Kind::ProxyConnectionTimeout);
        assert_eq!(map(Kind::HostNotFound), Kind::ProxyNotFound);
        assert_eq!(map(Kind::Network), Kind::Network);
    }

    #[test]
    fn test_handler_only_serves_tcp_over_http_proxy() {
        let handler = HttpSocketEngineHandler;
        let http = NetworkProxy::new(ProxyType::HttpProxy, "proxy", 8080);
        let socks = NetworkProxy::new(ProxyType::Socks5Proxy, "proxy", 1080);
        assert!(handler.create_engine(SocketType::Tcp, &http).is_some());
        assert!(handler.create_engine(SocketType::Udp, &http).is_none());
        assert!(handler.create_engine(SocketType::Tcp, &socks).is_none());
    }

    // ========================================================================
    // Handshake against a scripted transport
    // ========================================================================

    #[derive(Debug, Default)]
    struct Wire {
        sent: Vec<u8>,
        incoming: VecDeque<Vec<u8>>,
        refuse: bool,
    }

    #[derive(Debug)]
    struct ScriptedTransport {
        base: EngineState,
        wire: Arc<Mutex<Wire>>,
    }

    impl SocketEngine for ScriptedTransport {
        fn base(&self) -> &EngineState {
            &self.base
        }
        fn base_mut(&mut self) -> &mut EngineState {
            &mut self.base
        }
        fn initialize(&mut self, socket_type: SocketType, protocol: NetworkLayerProtocol) -> Result<()> {
            self.base.socket_type = socket_type;
            self.base.protocol = protocol;
            self.base.state = SocketState::Unconnected;
            Ok(())
        }
        fn initialize_from_descriptor(&mut self, _: RawDescriptor, _: SocketState) -> Result<()> {
            Ok(())
        }
        fn descriptor(&self) -> Option<RawDescriptor> {
            None
        }
        fn is_valid(&self) -> bool {
            true
        }
        fn connect_to_host(&mut self, _: &HostAddress, _: u16) -> Result<ConnectProgress> {
            self.base.state = SocketState::Connecting;
            Ok(ConnectProgress::InProgress)
        }
        fn connection_notification(&mut self) -> SocketState {
            if self.wire.lock().refuse {
                self.base.state = SocketState::Unconnected;
                self.base.fail(SocketError::from_kind(Kind::ConnectionRefused));
            } else {
                self.base.state = SocketState::Connected;
            }
            self.base.state
        }
        fn bind(&mut self, _: &HostAddress, _: u16) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) {
            self.base.state = SocketState::Unconnected;
        }
        fn bytes_available(&self) -> usize {
            self.wire.lock().incoming.front().map_or(0, Vec::len)
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<Transfer> {
            let mut wire = self.wire.lock();
            match wire.incoming.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        wire.incoming.push_front(chunk[n..].to_vec());
                    }
                    Ok(Transfer::Done(n))
                }
                None => Ok(Transfer::WouldBlock),
            }
        }
        fn write(&mut self, data: &[u8]) -> Result<Transfer> {
            self.wire.lock().sent.extend_from_slice(data);
            Ok(Transfer::Done(data.len()))
        }
        fn wait_for_read_or_write(&mut self, _: bool, _: bool, _: Option<Instant>) -> Result<Readiness> {
            Ok(Readiness {
                readable: true,
                writable: true,
                timed_out: false,
            })
        }
    }

    fn scripted_engine() -> (HttpSocketEngine, Arc<Mutex<Wire>>) {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let transport = ScriptedTransport {
            base: EngineState::default(),
            wire: Arc::clone(&wire),
        };
        let proxy = NetworkProxy::new(ProxyType::HttpProxy, "127.0.0.1", 3128);
        let mut engine = HttpSocketEngine::with_transport(proxy, Some(Box::new(transport)));
        engine
            .initialize(SocketType::Tcp, NetworkLayerProtocol::AnyIp)
            .unwrap();
        (engine, wire)
    }

    #[test]
    fn test_successful_tunnel_keeps_leftover_bytes() {
        let (mut engine, wire) = scripted_engine();
        assert_eq!(
            engine.connect_to_host_by_name("example.com", 443).unwrap(),
            ConnectProgress::InProgress
        );
        assert!(engine.interest().write);

        assert_eq!(engine.connection_notification(), SocketState::Connecting);
        assert!(wire.lock().sent.starts_with(b"CONNECT example.com:443"));
        assert!(engine.interest().read);

        wire.lock()
            .incoming
            .push_back(b"HTTP/1.1 200 OK\r\nVia: test\r\n\r\nhello".to_vec());
        assert_eq!(engine.connection_notification(), SocketState::Connected);
        assert_eq!(engine.bytes_available(), 5);

        let mut buf = [0u8; 16];
        assert_eq!(engine.read(&mut buf).unwrap(), Transfer::Done(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(engine.read(&mut buf).unwrap(), Transfer::WouldBlock);
        assert_eq!(engine.write(b"abc").unwrap(), Transfer::Done(3));
    }

    #[test]
    fn test_response_split_across_reads() {
        let (mut engine, wire) = scripted_engine();
        engine.connect_to_host_by_name("example.com", 80).unwrap();
        engine.connection_notification();
        wire.lock().incoming.push_back(b"HTTP/1.1 200 OK\r".to_vec());
        assert_eq!(engine.connection_notification(), SocketState::Connecting);
        wire.lock().incoming.push_back(b"\n\r\n".to_vec());
        assert_eq!(engine.connection_notification(), SocketState::Connected);
        assert_eq!(engine.bytes_available(), 0);
    }

    #[test]
    fn test_auth_required_is_reported() {
        let (mut engine, wire) = scripted_engine();
        engine.connect_to_host_by_name("example.com", 80).unwrap();
        engine.connection_notification();
        wire.lock()
            .incoming
            .push_back(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n".to_vec());
        assert_eq!(engine.connection_notification(), SocketState::Unconnected);
        assert_eq!(engine.error_kind(), Kind::ProxyAuthenticationRequired);
    }

    #[test]
    fn test_garbage_response_is_protocol_error() {
        let (mut engine, wire) = scripted_engine();
        engine.connect_to_host_by_name("example.com", 80).unwrap();
        engine.connection_notification();
        wire.lock().incoming.push_back(b"hello there\r\n\r\n".to_vec());
        assert_eq!(engine.connection_notification(), SocketState::Unconnected);
        assert_eq!(engine.error_kind(), Kind::ProxyProtocol);
    }

    #[test]
    fn test_refused_proxy_connection() {
        let (mut engine, wire) = scripted_engine();
        wire.lock().refuse = true;
        engine.connect_to_host_by_name("example.com", 80).unwrap();
        assert_eq!(engine.connection_notification(), SocketState::Unconnected);
        assert_eq!(engine.error_kind(), Kind::ProxyConnectionRefused);
        assert!(engine.error().is_proxy_error());
    }

    #[test]
    fn test_io_before_tunnel_is_wrong_state() {
        let (mut engine, _wire) = scripted_engine();
        let mut buf = [0u8; 4];
        assert_eq!(engine.read(&mut buf).unwrap_err().kind, Kind::OperationError);
        assert_eq!(engine.write(b"x").unwrap_err().kind, Kind::OperationError);
        assert_eq!(
            engine.bind(&HostAddress::default(), 0).unwrap_err().kind,
            Kind::UnsupportedSocketOperation
        );
    }
}
