//! Socket configuration.
//!
//! All fields have sensible defaults, so an empty TOML table yields a working
//! [`SocketConfig`]. Call [`SocketConfig::validate`] after loading.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sockeng_addr::NetworkLayerProtocol;

use crate::socket::BindMode;

/// Address family a socket prefers when a name resolves to several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredProtocol {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl PreferredProtocol {
    pub fn to_protocol(self) -> NetworkLayerProtocol {
        match self {
            PreferredProtocol::Any => NetworkLayerProtocol::AnyIp,
            PreferredProtocol::Ipv4 => NetworkLayerProtocol::Ipv4,
            PreferredProtocol::Ipv6 => NetworkLayerProtocol::Ipv6,
        }
    }
}

/// Serde form of [`BindMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindModeConfig {
    #[default]
    DefaultForPlatform,
    ShareAddress,
    DontShareAddress,
    ReuseAddressHint,
}

impl BindModeConfig {
    pub fn to_bind_mode(self) -> BindMode {
        match self {
            BindModeConfig::DefaultForPlatform => BindMode::DEFAULT_FOR_PLATFORM,
            BindModeConfig::ShareAddress => BindMode::SHARE_ADDRESS,
            BindModeConfig::DontShareAddress => BindMode::DONT_SHARE_ADDRESS,
            BindModeConfig::ReuseAddressHint => BindMode::REUSE_ADDRESS_HINT,
        }
    }
}

/// Behaviour knobs of an [`AbstractSocket`](crate::socket::AbstractSocket).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Time allowed for each candidate address to connect (default: 30000).
    pub connect_timeout_ms: u64,

    /// Grace period for flushing writes on disconnect (default: 2000).
    pub disconnect_timeout_ms: u64,

    /// Cap on buffered incoming bytes; 0 means unlimited.
    pub read_buffer_max_size: usize,

    /// Buffer reads and writes in the socket (default: true).
    ///
    /// Unbuffered sockets pass reads and writes straight to the engine.
    pub buffered: bool,

    /// SCTP only: number of channels for datagram mode. Negative selects
    /// stream mode, 0 lets the association decide.
    pub max_channel_count: i32,

    pub preferred_protocol: PreferredProtocol,

    /// Try every resolved address twice before giving up (default: true).
    pub retry_each_address: bool,

    pub bind_mode: BindModeConfig,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            disconnect_timeout_ms: 2_000,
            read_buffer_max_size: 0,
            buffered: true,
            max_channel_count: 0,
            preferred_protocol: PreferredProtocol::Any,
            retry_each_address: true,
            bind_mode: BindModeConfig::DefaultForPlatform,
        }
    }
}

impl SocketConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.connect_timeout_ms == 0 {
            errors.push("socket.connect_timeout_ms must be > 0".to_string());
        }
        if self.disconnect_timeout_ms == 0 {
            errors.push("socket.disconnect_timeout_ms must be > 0".to_string());
        }
        if self.max_channel_count > i32::from(u16::MAX) {
            errors.push(format!(
                "socket.max_channel_count ({}) exceeds the SCTP stream limit ({})",
                self.max_channel_count,
                u16::MAX
            ));
        }
        if !self.buffered && self.read_buffer_max_size != 0 {
            tracing::warn!("socket.read_buffer_max_size has no effect on unbuffered sockets");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
