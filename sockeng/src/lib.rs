//! # sockeng: socket engine abstraction and buffered sockets
//!
//! A transport-neutral socket layer: engines do the OS work, the abstract
//! socket runs the connection state machine on top of them.
//!
//! ## Architecture
//!
//! ```text
//! AbstractSocket / SocketListener        (state machine, buffering, channels)
//!            │
//!      EngineRegistry                    (handlers first, native fallback)
//!        │            │
//! HttpSocketEngine  NativeSocketEngine   (CONNECT tunnel / POSIX descriptor)
//! ```
//!
//! ## Design
//!
//! - **Engines never block**: transfers report `Transfer::WouldBlock`, and
//!   blocking is only done by the explicit `wait_for_*` calls.
//! - **Sticky errors**: every failing engine call records its error and also
//!   returns it, so callers can use `?` or inspect the engine afterwards.
//! - **Event driven socket**: [`AbstractSocket::advance`] is the single
//!   entry point for readiness, lookup results and timers; notifications
//!   are queued for the owner instead of being delivered through callbacks.
//! - **Channels**: stream sockets have one channel; SCTP sockets in
//!   datagram mode get one message queue per stream.
//!
//! ## Module Organization
//!
//! - `engine`: the [`SocketEngine`] contract and shared engine state
//! - `native`: the POSIX engine (unix only)
//! - `http_tunnel`: HTTP CONNECT proxy engine
//! - `registry`: engine handler registry and pending accepted descriptors
//! - `socket`: [`AbstractSocket`] state machine and buffered I/O
//! - `sctp`: SCTP datagram mode and per-channel buffers
//! - `listener`: [`SocketListener`] for accepting connections
//! - `dns`, `proxy`: resolver and proxy collaborators
//! - `packet`, `ring_buffer`: datagram metadata and chunked byte queues
//! - `config`, `telemetry`, `error`: ambient concerns

pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod http_tunnel;
pub mod listener;
#[cfg(unix)]
pub mod native;
pub mod packet;
pub mod proxy;
pub mod registry;
pub mod ring_buffer;
pub mod sctp;
pub mod socket;
pub mod telemetry;

pub use config::{BindModeConfig, PreferredProtocol, SocketConfig};
pub use dns::{HostInfo, HostResolver, Lookup, LookupId, SystemResolver};
pub use engine::{
    ConnectProgress, Interest, NetworkInterface, RawDescriptor, Readiness, SocketEngine,
    SocketOption, SocketState, SocketType, Transfer,
};
pub use error::{Result, SocketError, SocketErrorKind};
pub use http_tunnel::{HttpSocketEngine, HttpSocketEngineHandler};
pub use listener::SocketListener;
#[cfg(unix)]
pub use native::NativeSocketEngine;
pub use packet::{IpPacketHeader, NetworkDatagram, PacketHeaderOptions};
pub use proxy::{NetworkProxy, ProxyConfig, ProxyResolver, ProxyType};
pub use registry::{EngineHandler, EngineRegistry};
pub use sctp::ChannelSet;
pub use socket::{AbstractSocket, BindMode, SocketEvent, SocketNotification};
pub use sockeng_addr::{HostAddress, NetworkLayerProtocol, SpecialAddress};
