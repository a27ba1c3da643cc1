//! Configuration loading and parsing.
//!
//! Precedence, lowest first:
//! 1. Default values
//! 2. Configuration file
//! 3. Environment variables (`SOCKENG_` prefix, `__` between sections)
//! 4. Command-line arguments

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config as ConfigLoader;
use sockeng::{PreferredProtocol, ProxyType};

use super::ProbeConfig;

/// Command-line interface for the probe.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "sockeng.toml")]
    pub config: String,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Per-address connect timeout in milliseconds (overrides config file)
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// HTTP proxy as `host:port` for outgoing TCP connections
    #[arg(long)]
    pub http_proxy: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a TCP connection, optionally send a line and print the reply
    Connect {
        host: String,
        port: u16,

        /// Line to send once connected
        #[arg(long)]
        send: Option<String>,

        /// How long to wait for each step, in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Send one UDP datagram, optionally waiting for a reply
    SendDatagram {
        host: String,
        port: u16,
        message: String,

        #[arg(long)]
        wait_reply: bool,

        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Accept TCP connections and print what they send
    Listen {
        #[arg(long, default_value = "127.0.0.1")]
        address: String,

        #[arg(long, default_value_t = 0)]
        port: u16,

        /// Number of connections to serve before exiting
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Send each received line back
        #[arg(long)]
        echo: bool,
    },
}

/// Load and parse probe configuration from the process arguments.
///
/// `--print-default-config` and `--validate` exit the process.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration file cannot be parsed
/// - Validation fails
/// - No command was given
pub fn load_config() -> Result<(ProbeConfig, Command)> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        print_default_config()?;
        std::process::exit(0);
    }

    let config = resolve(&cli, config::Environment::with_prefix("SOCKENG"))?;

    if cli.validate {
        println!("✓ Configuration is valid");
        std::process::exit(0);
    }

    let command = cli
        .command
        .clone()
        .context("No command given; see --help")?;
    Ok((config, command))
}

/// Build the effective configuration for `cli` with overrides from `env`.
pub fn resolve(cli: &CliArgs, env: config::Environment) -> Result<ProbeConfig> {
    let mut config = load_config_file(&cli.config)?;
    apply_env_overrides(&mut config, env)?;
    apply_cli_overrides(&mut config, cli)?;

    config.validate().map_err(|errors| {
        anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
    })?;
    Ok(config)
}

/// Load configuration from a TOML file.
pub fn load_config_file(path: &str) -> Result<ProbeConfig> {
    let path_obj = Path::new(path);

    if !path_obj.exists() {
        tracing::warn!(
            config_path = %path,
            "Configuration file not found, using defaults"
        );
        return Ok(ProbeConfig::default());
    }

    let config_str = std::fs::read_to_string(path_obj)
        .with_context(|| format!("Failed to read config file: {}", path))?;

    toml::from_str(&config_str).with_context(|| format!("Failed to parse TOML config: {}", path))
}

/// Apply environment variable overrides.
///
/// Examples:
/// - `SOCKENG_SOCKET__CONNECT_TIMEOUT_MS=5000`
/// - `SOCKENG_PROXY__HOST=proxy.internal`
/// - `SOCKENG_LOGGING__LEVEL=debug`
pub fn apply_env_overrides(config: &mut ProbeConfig, env: config::Environment) -> Result<()> {
    let env_config = ConfigLoader::builder()
        .add_source(env.prefix_separator("_").separator("__"))
        .build()
        .context("Failed to load environment variables")?;

    // Known keys only; unknown variables are ignored.
    if let Ok(ms) = env_config.get_int("socket.connect_timeout_ms") {
        config.socket.connect_timeout_ms = u64::try_from(ms).context("socket.connect_timeout_ms")?;
    }
    if let Ok(ms) = env_config.get_int("socket.disconnect_timeout_ms") {
        config.socket.disconnect_timeout_ms =
            u64::try_from(ms).context("socket.disconnect_timeout_ms")?;
    }
    if let Ok(size) = env_config.get_int("socket.read_buffer_max_size") {
        config.socket.read_buffer_max_size =
            usize::try_from(size).context("socket.read_buffer_max_size")?;
    }
    if let Ok(buffered) = env_config.get_bool("socket.buffered") {
        config.socket.buffered = buffered;
    }
    if let Ok(count) = env_config.get_int("socket.max_channel_count") {
        config.socket.max_channel_count =
            i32::try_from(count).context("socket.max_channel_count")?;
    }
    if let Ok(protocol) = env_config.get_string("socket.preferred_protocol") {
        config.socket.preferred_protocol = parse_preferred_protocol(&protocol)?;
    }
    if let Ok(proxy_type) = env_config.get_string("proxy.proxy_type") {
        config.proxy.proxy_type = parse_proxy_type(&proxy_type)?;
    }
    if let Ok(host) = env_config.get_string("proxy.host") {
        config.proxy.host = host;
    }
    if let Ok(port) = env_config.get_int("proxy.port") {
        config.proxy.port = u16::try_from(port).context("proxy.port")?;
    }
    if let Ok(user) = env_config.get_string("proxy.user") {
        config.proxy.user = Some(user);
    }
    if let Ok(password) = env_config.get_string("proxy.password") {
        config.proxy.password = Some(password);
    }
    if let Ok(level) = env_config.get_string("logging.level") {
        if let Ok(parsed_level) = level.parse() {
            config.logging.level = parsed_level;
        }
    }
    if let Ok(enabled) = env_config.get_bool("telemetry.enable_metrics") {
        config.telemetry.enable_metrics = enabled;
    }

    Ok(())
}

/// Apply command-line argument overrides.
pub fn apply_cli_overrides(config: &mut ProbeConfig, cli: &CliArgs) -> Result<()> {
    if let Some(ref level_str) = cli.log_level {
        if let Ok(level) = level_str.parse() {
            config.logging.level = level;
        } else {
            tracing::warn!(level = %level_str, "Invalid log level specified, ignoring");
        }
    }

    if let Some(ms) = cli.connect_timeout_ms {
        config.socket.connect_timeout_ms = ms;
    }

    if let Some(ref proxy) = cli.http_proxy {
        let (host, port) = proxy
            .rsplit_once(':')
            .with_context(|| format!("--http-proxy must be host:port, got '{}'", proxy))?;
        config.proxy.proxy_type = ProxyType::HttpProxy;
        config.proxy.host = host.trim_matches(|c| c == '[' || c == ']').to_string();
        config.proxy.port = port
            .parse()
            .with_context(|| format!("Invalid proxy port '{}'", port))?;
    }

    Ok(())
}

fn parse_preferred_protocol(value: &str) -> Result<PreferredProtocol> {
    match value.to_lowercase().as_str() {
        "any" => Ok(PreferredProtocol::Any),
        "ipv4" => Ok(PreferredProtocol::Ipv4),
        "ipv6" => Ok(PreferredProtocol::Ipv6),
        other => anyhow::bail!("Invalid socket.preferred_protocol: {}", other),
    }
}

fn parse_proxy_type(value: &str) -> Result<ProxyType> {
    match value.to_lowercase().as_str() {
        "default_proxy" | "default" => Ok(ProxyType::DefaultProxy),
        "no_proxy" | "none" => Ok(ProxyType::NoProxy),
        "http_proxy" | "http" => Ok(ProxyType::HttpProxy),
        "socks5_proxy" | "socks5" => Ok(ProxyType::Socks5Proxy),
        other => anyhow::bail!("Unsupported proxy.proxy_type: {}", other),
    }
}

/// Print the default configuration in TOML format.
fn print_default_config() -> Result<()> {
    let default_config = ProbeConfig::default();
    let toml_str =
        toml::to_string_pretty(&default_config).context("Failed to serialize default config")?;
    println!("{}", toml_str);
    Ok(())
}
