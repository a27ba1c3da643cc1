//! Proxy descriptors and proxy selection.
//!
//! A socket either has an explicit [`NetworkProxy`] or asks a
//! [`ProxyResolver`] for candidates. [`select_proxy`] then keeps the first
//! candidate whose capabilities cover the socket type. When nothing fits the
//! socket connects directly. A resolver that hands back an unresolved
//! [`ProxyType::DefaultProxy`] is reported as an unsupported operation.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::engine::SocketType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    /// Unresolved: "use whatever the resolver says".
    #[default]
    DefaultProxy,
    NoProxy,
    Socks5Proxy,
    HttpProxy,
    HttpCachingProxy,
    FtpCachingProxy,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProxyCapabilities: u16 {
        const TUNNELING = 0x0001;
        const LISTENING = 0x0002;
        const UDP_TUNNELING = 0x0004;
        const CACHING = 0x0008;
        const HOST_NAME_LOOKUP = 0x0010;
        const SCTP_TUNNELING = 0x0020;
        const SCTP_LISTENING = 0x0040;
    }
}

impl ProxyType {
    pub fn default_capabilities(self) -> ProxyCapabilities {
        use ProxyCapabilities as C;
        match self {
            ProxyType::DefaultProxy | ProxyType::NoProxy => {
                C::TUNNELING | C::LISTENING | C::UDP_TUNNELING | C::SCTP_TUNNELING | C::SCTP_LISTENING
            }
            ProxyType::Socks5Proxy => {
                C::TUNNELING | C::LISTENING | C::UDP_TUNNELING | C::HOST_NAME_LOOKUP
            }
            ProxyType::HttpProxy => C::TUNNELING | C::CACHING | C::HOST_NAME_LOOKUP,
            ProxyType::HttpCachingProxy | ProxyType::FtpCachingProxy => {
                C::CACHING | C::HOST_NAME_LOOKUP
            }
        }
    }
}

/// One proxy server description.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkProxy {
    pub proxy_type: ProxyType,
    pub host_name: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub capabilities: ProxyCapabilities,
}

impl Default for NetworkProxy {
    fn default() -> Self {
        Self::new(ProxyType::DefaultProxy, "", 0)
    }
}

impl NetworkProxy {
    pub fn new(proxy_type: ProxyType, host_name: impl Into<String>, port: u16) -> Self {
        Self {
            proxy_type,
            host_name: host_name.into(),
            port,
            user: None,
            password: None,
            capabilities: proxy_type.default_capabilities(),
        }
    }

    pub fn no_proxy() -> Self {
        Self::new(ProxyType::NoProxy, "", 0)
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: ProxyCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Whether this proxy can carry a socket of `socket_type`.
    pub fn supports(&self, socket_type: SocketType) -> bool {
        let needed = match socket_type {
            SocketType::Tcp => ProxyCapabilities::TUNNELING,
            SocketType::Udp => ProxyCapabilities::UDP_TUNNELING,
            SocketType::Sctp => ProxyCapabilities::SCTP_TUNNELING,
            SocketType::Unknown => return true,
        };
        self.capabilities.contains(needed)
    }
}

impl fmt::Debug for NetworkProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkProxy")
            .field("proxy_type", &self.proxy_type)
            .field("host_name", &self.host_name)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// What kind of socket a proxy query is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    TcpSocket,
    UdpSocket,
    SctpSocket,
    TcpServer,
    SctpServer,
}

impl From<SocketType> for QueryType {
    fn from(socket_type: SocketType) -> Self {
        match socket_type {
            SocketType::Udp => QueryType::UdpSocket,
            SocketType::Sctp => QueryType::SctpSocket,
            SocketType::Tcp => QueryType::TcpSocket,
            SocketType::Unknown => QueryType::TcpServer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyQuery {
    pub peer_host: String,
    pub peer_port: u16,
    pub protocol_tag: String,
    pub query_type: QueryType,
}

impl ProxyQuery {
    pub fn new(peer_host: impl Into<String>, peer_port: u16, query_type: QueryType) -> Self {
        Self {
            peer_host: peer_host.into(),
            peer_port,
            protocol_tag: String::new(),
            query_type,
        }
    }
}

/// Source of proxy candidates for sockets without an explicit proxy.
pub trait ProxyResolver: Send + Sync {
    fn proxies_for(&self, query: &ProxyQuery) -> Vec<NetworkProxy>;
}

/// Always answers "connect directly".
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProxyResolver;

impl ProxyResolver for NoProxyResolver {
    fn proxies_for(&self, _query: &ProxyQuery) -> Vec<NetworkProxy> {
        vec![NetworkProxy::no_proxy()]
    }
}

/// Returns a fixed list regardless of the query.
#[derive(Debug, Clone, Default)]
pub struct StaticProxyResolver {
    proxies: Vec<NetworkProxy>,
}

impl StaticProxyResolver {
    pub fn new(proxies: Vec<NetworkProxy>) -> Self {
        Self { proxies }
    }
}

impl ProxyResolver for StaticProxyResolver {
    fn proxies_for(&self, _query: &ProxyQuery) -> Vec<NetworkProxy> {
        self.proxies.clone()
    }
}

/// Pick the first candidate able to carry `socket_type`.
///
/// Falls back to a direct connection when none qualifies.
pub fn select_proxy(socket_type: SocketType, candidates: &[NetworkProxy]) -> NetworkProxy {
    candidates
        .iter()
        .find(|p| p.supports(socket_type))
        .cloned()
        .unwrap_or_else(NetworkProxy::no_proxy)
}

/// Resolve the proxy a socket should use for `host:port`.
pub fn resolve_proxy(
    explicit: &NetworkProxy,
    resolver: &dyn ProxyResolver,
    socket_type: SocketType,
    host: &str,
    port: u16,
) -> NetworkProxy {
    if explicit.proxy_type != ProxyType::DefaultProxy {
        return select_proxy(socket_type, std::slice::from_ref(explicit));
    }
    let query = ProxyQuery::new(host, port, QueryType::from(socket_type));
    select_proxy(socket_type, &resolver.proxies_for(&query))
}

/// Serde form of a proxy, as found in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    /// `default_proxy` defers to the resolver, which means a direct connection.
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy_type: ProxyType::DefaultProxy,
            host: String::new(),
            port: 0,
            user: None,
            password: None,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let needs_host = !matches!(self.proxy_type, ProxyType::DefaultProxy | ProxyType::NoProxy);
        if needs_host && self.host.is_empty() {
            errors.push(format!("proxy.host is required for {:?}", self.proxy_type));
        }
        if needs_host && self.port == 0 {
            errors.push("proxy.port must be non-zero".to_string());
        }
        if self.password.is_some() && self.user.is_none() {
            errors.push("proxy.password given without proxy.user".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn to_proxy(&self) -> NetworkProxy {
        let mut proxy = NetworkProxy::new(self.proxy_type, self.host.clone(), self.port);
        proxy.user = self.user.clone();
        proxy.password = self.password.clone();
        proxy
    }
}
