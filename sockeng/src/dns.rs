//! Host name resolution collaborator.
//!
//! The socket only needs three things from a resolver: start a lookup that
//! may complete immediately, abort it, and collect the completion later.
//! [`SystemResolver`] answers literal addresses on the spot and sends names
//! to a worker thread that calls the OS resolver.

use std::collections::{HashMap, HashSet};
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use sockeng_addr::HostAddress;
use tracing::{debug, trace};

/// Identifier of one lookup. Ids are positive and never reused.
pub type LookupId = i32;

static NEXT_LOOKUP_ID: AtomicI32 = AtomicI32::new(1);

pub fn next_lookup_id() -> LookupId {
    NEXT_LOOKUP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Result of a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub lookup_id: LookupId,
    pub host_name: String,
    pub addresses: Vec<HostAddress>,
    pub error: Option<String>,
}

impl HostInfo {
    pub fn new(lookup_id: LookupId, host_name: impl Into<String>) -> Self {
        Self {
            lookup_id,
            host_name: host_name.into(),
            addresses: Vec::new(),
            error: None,
        }
    }

    pub fn with_addresses(mut self, addresses: Vec<HostAddress>) -> Self {
        self.addresses = addresses;
        self
    }
}

/// How a started lookup is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Immediate(HostInfo),
    Pending(LookupId),
}

pub trait HostResolver: Send + Sync {
    fn start_lookup(&self, name: &str) -> Lookup;

    /// Drop the lookup; its completion is never delivered.
    fn abort_lookup(&self, id: LookupId);

    /// Take the completion for `id` if it has arrived.
    fn take_completed(&self, id: LookupId) -> Option<HostInfo>;

    /// Resolve synchronously.
    fn lookup_blocking(&self, name: &str) -> HostInfo;
}

/// Resolve `name` with the OS resolver, keeping address order and dropping
/// duplicates.
pub fn resolve_now(id: LookupId, name: &str) -> HostInfo {
    let mut info = HostInfo::new(id, name);
    if let Some(address) = HostAddress::parse(name) {
        info.addresses.push(address);
        return info;
    }
    match (name, 0u16).to_socket_addrs() {
        Ok(resolved) => {
            for addr in resolved {
                let address = HostAddress::from(addr.ip());
                if !info.addresses.contains(&address) {
                    info.addresses.push(address);
                }
            }
            if info.addresses.is_empty() {
                info.error = Some("Host not found".to_string());
            }
        }
        Err(e) => info.error = Some(e.to_string()),
    }
    info
}

/// Threaded OS resolver.
#[derive(Debug)]
pub struct SystemResolver {
    tx: Sender<HostInfo>,
    rx: Receiver<HostInfo>,
    completed: Mutex<HashMap<LookupId, HostInfo>>,
    aborted: Mutex<HashSet<LookupId>>,
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemResolver {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            completed: Mutex::new(HashMap::new()),
            aborted: Mutex::new(HashSet::new()),
        }
    }

    /// Channel carrying raw completions, for callers that select on it.
    ///
    /// Completions consumed here bypass [`HostResolver::take_completed`].
    pub fn completions(&self) -> Receiver<HostInfo> {
        self.rx.clone()
    }

    fn drain(&self) {
        let mut completed = self.completed.lock();
        let mut aborted = self.aborted.lock();
        while let Ok(info) = self.rx.try_recv() {
            if aborted.remove(&info.lookup_id) {
                trace!(lookup_id = info.lookup_id, "dropping aborted lookup result");
                continue;
            }
            completed.insert(info.lookup_id, info);
        }
    }
}

impl HostResolver for SystemResolver {
    fn start_lookup(&self, name: &str) -> Lookup {
        let id = next_lookup_id();
        if let Some(address) = HostAddress::parse(name) {
            return Lookup::Immediate(HostInfo::new(id, name).with_addresses(vec![address]));
        }

        debug!(lookup_id = id, host = name, "starting host lookup");
        let tx = self.tx.clone();
        let name = name.to_string();
        let spawned = thread::Builder::new()
            .name(format!("sockeng-dns-{}", id))
            .spawn(move || {
                let info = resolve_now(id, &name);
                let _ = tx.send(info);
            });
        if let Err(e) = spawned {
            let mut info = HostInfo::new(id, "");
            info.error = Some(format!("failed to spawn resolver thread: {}", e));
            return Lookup::Immediate(info);
        }
        Lookup::Pending(id)
    }

    fn abort_lookup(&self, id: LookupId) {
        if self.completed.lock().remove(&id).is_none() {
            self.aborted.lock().insert(id);
        }
    }

    fn take_completed(&self, id: LookupId) -> Option<HostInfo> {
        self.drain();
        self.completed.lock().remove(&id)
    }

    fn lookup_blocking(&self, name: &str) -> HostInfo {
        resolve_now(next_lookup_id(), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_literal_resolves_immediately() {
        let resolver = SystemResolver::new();
        match resolver.start_lookup("127.0.0.1") {
            Lookup::Immediate(info) => {
                assert_eq!(info.addresses, vec![HostAddress::parse("127.0.0.1").unwrap()]);
                assert!(info.error.is_none());
            }
            Lookup::Pending(_) => panic!("literal address should not be deferred"),
        }
    }

    #[test]
    fn test_lookup_ids_increase() {
        let a = next_lookup_id();
        let b = next_lookup_id();
        assert!(b > a);
        assert!(a > 0);
    }

    #[test]
    fn test_localhost_lookup_completes() {
        let resolver = SystemResolver::new();
        let Lookup::Pending(id) = resolver.start_lookup("localhost") else {
            panic!("name lookup should be deferred");
        };
        let deadline = Instant::now() + Duration::from_secs(10);
        let info = loop {
            if let Some(info) = resolver.take_completed(id) {
                break info;
            }
            assert!(Instant::now() < deadline, "lookup did not complete");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(info.lookup_id, id);
        assert!(info.addresses.iter().all(|a| a.is_loopback()));
    }

    #[test]
    fn test_aborted_lookup_is_dropped() {
        let resolver = SystemResolver::new();
        let Lookup::Pending(id) = resolver.start_lookup("localhost") else {
            panic!("name lookup should be deferred");
        };
        resolver.abort_lookup(id);
        std::thread::sleep(Duration::from_millis(200));
        assert!(resolver.take_completed(id).is_none());
    }

    #[test]
    fn test_blocking_literal() {
        let info = SystemResolver::new().lookup_blocking("::1");
        assert_eq!(info.addresses.len(), 1);
        assert!(info.addresses[0].is_loopback());
    }
}
