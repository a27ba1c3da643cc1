//! Probe configuration.
//!
//! One TOML document with a table per concern. Every field has a default,
//! so an empty file (or no file at all) is a valid configuration.
//!
//! # Example
//!
//! ```toml
//! [socket]
//! connect_timeout_ms = 5000
//! preferred_protocol = "ipv4"
//!
//! [proxy]
//! proxy_type = "http_proxy"
//! host = "proxy.internal"
//! port = 3128
//!
//! [logging]
//! level = "debug"
//!
//! [telemetry]
//! enable_metrics = true
//! ```

pub mod loader;

pub use loader::{load_config, CliArgs, Command};

use serde::{Deserialize, Serialize};
use sockeng::{ProxyConfig, SocketConfig};

/// Top-level probe configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Behaviour of every socket the probe opens.
    pub socket: SocketConfig,

    /// Proxy used for outgoing TCP connections.
    pub proxy: ProxyConfig,

    pub logging: LoggingConfig,

    pub telemetry: TelemetryConfig,
}

impl ProbeConfig {
    /// Validate every section, collecting all problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.socket.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.proxy.validate() {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter level; `RUST_LOG` takes precedence when set.
    ///
    /// **Default:** `Info`
    pub level: LogLevel,

    /// Enable ANSI color codes in logs.
    ///
    /// **Default:** `true`
    pub enable_colors: bool,

    /// Include source file and line number in logs.
    ///
    /// **Default:** `false`
    pub include_file_line: bool,

    /// Include the event target (module path).
    ///
    /// **Default:** `true`
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            enable_colors: true,
            include_file_line: false,
            include_target: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// Metrics collection for the probe run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Start the metrics collector (default: true).
    pub enable_metrics: bool,

    /// Log a counter summary when the command finishes (default: true).
    pub print_summary: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            print_summary: true,
        }
    }
}
