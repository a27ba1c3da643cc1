//! Event-driven socket metrics.
//!
//! Recording is fire-and-forget: sockets push a [`MetricsEvent`] into a
//! global channel and move on. A collector thread started with
//! [`start_metrics_collector`] folds events into counters that can be read
//! back as a [`MetricsSnapshot`]. When no collector runs, recording is a
//! no-op.
//!
//! ```no_run
//! use sockeng::telemetry::{record_metric, start_metrics_collector, MetricsEvent};
//!
//! let handle = start_metrics_collector().expect("collector");
//! record_metric(MetricsEvent::BytesWritten { bytes: 512 });
//! println!("{:?}", handle.snapshot());
//! handle.shutdown();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{debug, error};

/// Global metrics event sender
static METRICS_SENDER: OnceCell<Sender<MetricsEvent>> = OnceCell::new();

/// Helper for timing an operation before recording it.
#[derive(Debug, Clone, Copy)]
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    #[inline]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Metrics events, kept small so they are cheap to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsEvent {
    // ========== Engine Layer ==========
    /// An engine was created; `native` is false for proxy tunnels.
    EngineCreated { native: bool },

    // ========== Connection Layer ==========
    /// One candidate address is being tried.
    ConnectAttempt,

    /// A socket reached the connected state.
    ConnectionEstablished { duration_ms: u64 },

    /// Every candidate failed.
    ConnectionFailed,

    /// A connected socket was disconnected.
    ConnectionClosed,

    // ========== Data Layer ==========
    BytesRead { bytes: usize },
    BytesWritten { bytes: usize },
    DatagramReceived { bytes: usize },
    DatagramSent { bytes: usize },

    /// Any error surfaced to the socket's owner.
    SocketError,
}

/// Fire-and-forget metric recording.
#[inline]
pub fn record_metric(event: MetricsEvent) {
    if let Some(sender) = METRICS_SENDER.get() {
        let _ = sender.send(event);
    }
}

/// Point-in-time copy of the collected counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub native_engines: u64,
    pub proxy_engines: u64,
    pub connect_attempts: u64,
    pub connections_established: u64,
    pub connections_failed: u64,
    pub connections_closed: u64,
    pub connect_time_ms_total: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub datagrams_received: u64,
    pub datagram_bytes_received: u64,
    pub datagrams_sent: u64,
    pub datagram_bytes_sent: u64,
    pub socket_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    native_engines: AtomicU64,
    proxy_engines: AtomicU64,
    connect_attempts: AtomicU64,
    connections_established: AtomicU64,
    connections_failed: AtomicU64,
    connections_closed: AtomicU64,
    connect_time_ms_total: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    datagrams_received: AtomicU64,
    datagram_bytes_received: AtomicU64,
    datagrams_sent: AtomicU64,
    datagram_bytes_sent: AtomicU64,
    socket_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn process_event(&self, event: MetricsEvent) {
        match event {
            MetricsEvent::EngineCreated { native: true } => Self::bump(&self.native_engines, 1),
            MetricsEvent::EngineCreated { native: false } => Self::bump(&self.proxy_engines, 1),
            MetricsEvent::ConnectAttempt => Self::bump(&self.connect_attempts, 1),
            MetricsEvent::ConnectionEstablished { duration_ms } => {
                Self::bump(&self.connections_established, 1);
                Self::bump(&self.connect_time_ms_total, duration_ms);
            }
            MetricsEvent::ConnectionFailed => Self::bump(&self.connections_failed, 1),
            MetricsEvent::ConnectionClosed => Self::bump(&self.connections_closed, 1),
            MetricsEvent::BytesRead { bytes } => Self::bump(&self.bytes_read, bytes as u64),
            MetricsEvent::BytesWritten { bytes } => Self::bump(&self.bytes_written, bytes as u64),
            MetricsEvent::DatagramReceived { bytes } => {
                Self::bump(&self.datagrams_received, 1);
                Self::bump(&self.datagram_bytes_received, bytes as u64);
            }
            MetricsEvent::DatagramSent { bytes } => {
                Self::bump(&self.datagrams_sent, 1);
                Self::bump(&self.datagram_bytes_sent, bytes as u64);
            }
            MetricsEvent::SocketError => Self::bump(&self.socket_errors, 1),
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            native_engines: load(&self.native_engines),
            proxy_engines: load(&self.proxy_engines),
            connect_attempts: load(&self.connect_attempts),
            connections_established: load(&self.connections_established),
            connections_failed: load(&self.connections_failed),
            connections_closed: load(&self.connections_closed),
            connect_time_ms_total: load(&self.connect_time_ms_total),
            bytes_read: load(&self.bytes_read),
            bytes_written: load(&self.bytes_written),
            datagrams_received: load(&self.datagrams_received),
            datagram_bytes_received: load(&self.datagram_bytes_received),
            datagrams_sent: load(&self.datagrams_sent),
            datagram_bytes_sent: load(&self.datagram_bytes_sent),
            socket_errors: load(&self.socket_errors),
        }
    }
}

/// Handle to the collector thread.
#[derive(Debug)]
pub struct MetricsHandle {
    thread: Option<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
    counters: Arc<Counters>,
}

impl MetricsHandle {
    /// A handle with no collector behind it; snapshots stay at zero.
    pub fn disabled() -> Self {
        Self {
            thread: None,
            shutdown_tx: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.thread.is_some()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.counters.snapshot()
    }

    /// Stop the collector after it drains queued events.
    pub fn shutdown(mut self) -> MetricsSnapshot {
        drop(self.shutdown_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("metrics collector panicked during shutdown");
            }
        }
        self.counters.snapshot()
    }
}

/// Error returned when a collector is already installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("metrics collector already running")]
pub struct CollectorAlreadyRunning;

/// Install the global event channel and start the collector thread.
///
/// Only one collector can run per process.
pub fn start_metrics_collector() -> Result<MetricsHandle, CollectorAlreadyRunning> {
    let (tx, rx) = unbounded();
    METRICS_SENDER.set(tx).map_err(|_| CollectorAlreadyRunning)?;
    let handle = spawn_collector(rx).map_err(|e| {
        error!(error = %e, "failed to spawn metrics collector");
        CollectorAlreadyRunning
    })?;
    debug!("metrics collector started");
    Ok(handle)
}

fn spawn_collector(events: Receiver<MetricsEvent>) -> std::io::Result<MetricsHandle> {
    let counters = Arc::new(Counters::default());
    let (shutdown_tx, shutdown_rx) = unbounded::<()>();
    let worker_counters = Arc::clone(&counters);
    let thread = thread::Builder::new()
        .name("sockeng-metrics".into())
        .spawn(move || collect(&events, &shutdown_rx, &worker_counters))?;
    Ok(MetricsHandle {
        thread: Some(thread),
        shutdown_tx: Some(shutdown_tx),
        counters,
    })
}

fn collect(events: &Receiver<MetricsEvent>, shutdown: &Receiver<()>, counters: &Counters) {
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => counters.process_event(event),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    for event in events.try_iter() {
        counters.process_event(event);
    }
}
