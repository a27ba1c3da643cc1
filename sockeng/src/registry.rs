//! Engine factory chain and the pending-descriptor table.
//!
//! Engine creation walks the registered [`EngineHandler`]s newest first and
//! falls back to the native engine only when the socket goes direct
//! (`NoProxy`). An unresolved `DefaultProxy` never gets an engine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use crate::engine::{RawDescriptor, SocketEngine, SocketType};
use crate::http_tunnel::HttpSocketEngineHandler;
use crate::proxy::{NetworkProxy, ProxyType};
use crate::telemetry::{record_metric, MetricsEvent};

/// Pluggable engine factory.
pub trait EngineHandler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn create_engine(
        &self,
        socket_type: SocketType,
        proxy: &NetworkProxy,
    ) -> Option<Box<dyn SocketEngine>>;

    fn create_engine_from_descriptor(
        &self,
        descriptor: RawDescriptor,
    ) -> Option<Box<dyn SocketEngine>> {
        let _ = descriptor;
        None
    }
}

type NativeFactory = dyn Fn() -> Option<Box<dyn SocketEngine>> + Send + Sync;

pub struct EngineRegistry {
    handlers: Mutex<Vec<Arc<dyn EngineHandler>>>,
    native: Box<NativeFactory>,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .handlers
            .lock()
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        f.debug_struct("EngineRegistry")
            .field("handlers", &names)
            .finish_non_exhaustive()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: Lazy<Arc<EngineRegistry>> = Lazy::new(|| {
    let registry = EngineRegistry::new();
    registry.register(Arc::new(HttpSocketEngineHandler));
    Arc::new(registry)
});

impl EngineRegistry {
    /// Registry with no handlers and the platform native engine as fallback.
    pub fn new() -> Self {
        Self::with_native_factory(native_engine)
    }

    /// Registry whose direct-connection fallback is `factory`.
    pub fn with_native_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Option<Box<dyn SocketEngine>> + Send + Sync + 'static,
    {
        Self {
            handlers: Mutex::new(Vec::new()),
            native: Box::new(factory),
        }
    }

    /// Process-wide registry with the HTTP tunnel handler installed.
    pub fn global() -> Arc<EngineRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Install `handler` ahead of every existing one.
    pub fn register(&self, handler: Arc<dyn EngineHandler>) {
        debug!(handler = handler.name(), "registering engine handler");
        self.handlers.lock().insert(0, handler);
    }

    pub fn unregister(&self, handler: &Arc<dyn EngineHandler>) {
        self.handlers.lock().retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn create_engine(
        &self,
        socket_type: SocketType,
        proxy: &NetworkProxy,
    ) -> Option<Box<dyn SocketEngine>> {
        if proxy.proxy_type == ProxyType::DefaultProxy {
            return None;
        }

        // Clone the list so handlers may touch the registry themselves.
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            if let Some(engine) = handler.create_engine(socket_type, proxy) {
                debug!(handler = handler.name(), ?socket_type, "engine created by handler");
                record_metric(MetricsEvent::EngineCreated { native: false });
                return Some(engine);
            }
        }

        if proxy.proxy_type != ProxyType::NoProxy {
            return None;
        }
        let engine = (self.native)();
        if engine.is_some() {
            record_metric(MetricsEvent::EngineCreated { native: true });
        }
        engine
    }

    pub fn create_engine_from_descriptor(
        &self,
        descriptor: RawDescriptor,
    ) -> Option<Box<dyn SocketEngine>> {
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            if let Some(engine) = handler.create_engine_from_descriptor(descriptor) {
                return Some(engine);
            }
        }
        (self.native)()
    }
}

#[cfg(unix)]
fn native_engine() -> Option<Box<dyn SocketEngine>> {
    Some(Box::new(crate::native::NativeSocketEngine::new()))
}

#[cfg(not(unix))]
fn native_engine() -> Option<Box<dyn SocketEngine>> {
    None
}

/// Token identifying one listener's slot in [`PendingDescriptors`].
pub type ListenerToken = u64;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

pub fn next_listener_token() -> ListenerToken {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// Accepted descriptors waiting to be claimed, keyed by listener.
#[derive(Debug, Default)]
pub struct PendingDescriptors {
    inner: Mutex<HashMap<ListenerToken, VecDeque<RawDescriptor>>>,
}

static PENDING: Lazy<PendingDescriptors> = Lazy::new(PendingDescriptors::default);

impl PendingDescriptors {
    pub fn global() -> &'static PendingDescriptors {
        &PENDING
    }

    pub fn push(&self, token: ListenerToken, descriptor: RawDescriptor) {
        self.inner.lock().entry(token).or_default().push_back(descriptor);
    }

    /// Claim the oldest descriptor queued under `token`.
    pub fn take(&self, token: ListenerToken) -> Option<RawDescriptor> {
        let mut inner = self.inner.lock();
        let queue = inner.get_mut(&token)?;
        let descriptor = queue.pop_front();
        if queue.is_empty() {
            inner.remove(&token);
        }
        descriptor
    }

    pub fn len(&self, token: ListenerToken) -> usize {
        self.inner.lock().get(&token).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, token: ListenerToken) -> bool {
        self.len(token) == 0
    }

    /// Remove every descriptor queued under `token` and return them.
    pub fn discard(&self, token: ListenerToken) -> Vec<RawDescriptor> {
        self.inner
            .lock()
            .remove(&token)
            .map(Vec::from)
            .unwrap_or_default()
    }
}
