//! Listening sockets.
//!
//! A [`SocketListener`] owns one engine in `Listening` state. Accepted
//! descriptors are parked in the process-wide [`PendingDescriptors`] table
//! under the listener's token until [`SocketListener::next_pending_connection`]
//! wraps one in a connected [`AbstractSocket`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use sockeng_addr::{HostAddress, NetworkLayerProtocol};
use tracing::{debug, info, warn};

use crate::config::SocketConfig;
use crate::engine::{Interest, RawDescriptor, SocketEngine, SocketOption, SocketState, SocketType};
use crate::error::{Result, SocketError, SocketErrorKind};
use crate::proxy::NetworkProxy;
use crate::registry::{next_listener_token, EngineRegistry, ListenerToken, PendingDescriptors};
use crate::socket::AbstractSocket;

pub const DEFAULT_BACKLOG: i32 = 50;
pub const DEFAULT_MAX_PENDING_CONNECTIONS: usize = 30;

#[derive(Debug)]
pub struct SocketListener {
    socket_type: SocketType,
    config: SocketConfig,
    registry: Arc<EngineRegistry>,
    engine: Option<Box<dyn SocketEngine>>,
    token: ListenerToken,
    backlog: i32,
    max_pending: usize,
    error: Option<SocketError>,
    address: HostAddress,
    port: u16,
}

impl SocketListener {
    pub fn new(socket_type: SocketType, config: SocketConfig) -> Self {
        Self {
            socket_type,
            config,
            registry: EngineRegistry::global(),
            engine: None,
            token: next_listener_token(),
            backlog: DEFAULT_BACKLOG,
            max_pending: DEFAULT_MAX_PENDING_CONNECTIONS,
            error: None,
            address: HostAddress::default(),
            port: 0,
        }
    }

    pub fn tcp() -> Self {
        Self::new(SocketType::Tcp, SocketConfig::default())
    }

    pub fn with_registry(mut self, registry: Arc<EngineRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn token(&self) -> ListenerToken {
        self.token
    }

    pub fn is_listening(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|e| e.state() == SocketState::Listening)
    }

    pub fn server_address(&self) -> &HostAddress {
        &self.address
    }

    pub fn server_port(&self) -> u16 {
        self.port
    }

    pub fn descriptor(&self) -> Option<RawDescriptor> {
        self.engine.as_ref().and_then(|e| e.descriptor())
    }

    pub fn interest(&self) -> Interest {
        self.engine.as_ref().map(|e| e.interest()).unwrap_or_default()
    }

    pub fn error(&self) -> Option<&SocketError> {
        self.error.as_ref()
    }

    pub fn listen_backlog_size(&self) -> i32 {
        self.backlog
    }

    /// Backlog passed to the next `listen` call.
    pub fn set_listen_backlog_size(&mut self, backlog: i32) {
        self.backlog = backlog;
    }

    pub fn max_pending_connections(&self) -> usize {
        self.max_pending
    }

    /// Stop accepting once this many connections wait to be claimed.
    pub fn set_max_pending_connections(&mut self, max: usize) {
        self.max_pending = max;
    }

    fn fail(&mut self, err: SocketError) -> SocketError {
        self.error = Some(err.clone());
        err
    }

    /// Bind to `address:port` and start listening.
    pub fn listen(&mut self, address: &HostAddress, port: u16) -> Result<()> {
        if self.is_listening() {
            warn!(port = self.port, "listen called while already listening");
            return Err(self.fail(SocketError::new(
                SocketErrorKind::OperationError,
                "Listener is already listening",
            )));
        }

        let protocol = match address.protocol() {
            NetworkLayerProtocol::Unknown => NetworkLayerProtocol::AnyIp,
            protocol => protocol,
        };
        let Some(mut engine) = self
            .registry
            .create_engine(self.socket_type, &NetworkProxy::no_proxy())
        else {
            return Err(self.fail(SocketError::from_kind(
                SocketErrorKind::UnsupportedSocketOperation,
            )));
        };

        let started = engine
            .initialize(self.socket_type, protocol)
            .and_then(|()| {
                engine.set_option(SocketOption::AddressReusable, 1);
                engine.bind(address, port)
            })
            .and_then(|()| engine.listen(self.backlog));
        if let Err(e) = started {
            engine.close();
            debug!(%address, port, error = %e, "listen failed");
            return Err(self.fail(e));
        }

        engine.set_read_notification_enabled(true);
        self.address = engine.local_address();
        self.port = engine.local_port();
        self.error = None;
        self.engine = Some(engine);
        info!(address = %self.address, port = self.port, backlog = self.backlog, "listening");
        Ok(())
    }

    /// Accept every connection the engine has ready, up to the pending cap.
    ///
    /// Returns how many were accepted.
    pub fn accept_ready(&mut self) -> usize {
        let pending = PendingDescriptors::global();
        let mut accepted = 0;
        loop {
            let Some(engine) = self.engine.as_mut() else {
                break;
            };
            if pending.len(self.token) >= self.max_pending {
                engine.set_read_notification_enabled(false);
                break;
            }
            match engine.accept() {
                Ok(Some(descriptor)) => {
                    pending.push(self.token, descriptor);
                    accepted += 1;
                }
                Ok(None) => break,
                Err(e) if e.kind.is_transient() => break,
                Err(e) => {
                    warn!(error = %e, "accept failed, pausing");
                    engine.set_read_notification_enabled(false);
                    self.error = Some(e);
                    break;
                }
            }
        }
        if accepted > 0 {
            debug!(accepted, pending = pending.len(self.token), "accepted connections");
        }
        accepted
    }

    pub fn has_pending_connections(&self) -> bool {
        !PendingDescriptors::global().is_empty(self.token)
    }

    pub fn pause_accepting(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.set_read_notification_enabled(false);
        }
    }

    pub fn resume_accepting(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.set_read_notification_enabled(true);
        }
    }

    /// Claim the oldest accepted connection as a connected socket.
    pub fn next_pending_connection(&mut self) -> Result<Option<AbstractSocket>> {
        let Some(descriptor) = PendingDescriptors::global().take(self.token) else {
            return Ok(None);
        };
        if self.is_listening() {
            self.resume_accepting();
        }

        let mut socket = AbstractSocket::new(self.socket_type, self.config.clone())
            .with_registry(Arc::clone(&self.registry));
        if let Err(e) = socket.set_socket_descriptor(descriptor, SocketState::Connected) {
            close_descriptor(descriptor);
            return Err(self.fail(e));
        }
        Ok(Some(socket))
    }

    /// Block until a connection is pending. `Ok(false)` on timeout.
    pub fn wait_for_new_connection(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if self.has_pending_connections() {
            return Ok(true);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let Some(engine) = self.engine.as_mut().filter(|e| e.state() == SocketState::Listening)
        else {
            return Err(self.fail(SocketError::new(
                SocketErrorKind::OperationError,
                "Listener is not listening",
            )));
        };
        let ready = match engine.wait_for_read(deadline) {
            Ok(ready) => ready,
            Err(e) if e.kind == SocketErrorKind::SocketTimeout => return Ok(false),
            Err(e) => return Err(self.fail(e)),
        };
        if ready.timed_out {
            return Ok(false);
        }
        self.accept_ready();
        Ok(self.has_pending_connections())
    }

    /// Stop listening and close every unclaimed connection.
    pub fn close(&mut self) {
        for descriptor in PendingDescriptors::global().discard(self.token) {
            close_descriptor(descriptor);
        }
        if let Some(mut engine) = self.engine.take() {
            debug!(port = self.port, "listener closed");
            engine.close();
        }
        self.address.clear();
        self.port = 0;
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(unix)]
fn close_descriptor(descriptor: RawDescriptor) {
    // SAFETY: the descriptor came from accept and nothing else owns it.
    unsafe {
        libc::close(descriptor);
    }
}

#[cfg(not(unix))]
fn close_descriptor(_descriptor: RawDescriptor) {}
