//! Socket error taxonomy.
//!
//! Every failing engine operation records a sticky [`SocketError`] (kind plus
//! human readable message) and also returns it. Would-block conditions are
//! never errors; they are reported through [`crate::engine::Transfer::WouldBlock`].

use thiserror::Error;

/// Result type for socket operations.
pub type Result<T> = std::result::Result<T, SocketError>;

/// Abstract error kinds shared by every engine and by the socket layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketErrorKind {
    ConnectionRefused,
    RemoteHostClosed,
    HostNotFound,
    /// Permission denied by the OS or by the proxy.
    SocketAccess,
    /// Out of descriptors, buffers or memory.
    SocketResource,
    SocketTimeout,
    DatagramTooLarge,
    /// Generic network failure (unreachable host or network, reset).
    Network,
    AddressInUse,
    SocketAddressNotAvailable,
    UnsupportedSocketOperation,
    /// Operation still in progress. Non-fatal.
    UnfinishedSocketOperation,
    ProxyAuthenticationRequired,
    ProxyConnectionRefused,
    ProxyConnectionClosed,
    ProxyConnectionTimeout,
    ProxyNotFound,
    ProxyProtocol,
    /// Operation not permitted in the socket's current state.
    OperationError,
    /// Transient condition such as an empty accept queue. Non-fatal.
    TemporaryError,
    Unknown,
}

impl SocketErrorKind {
    /// Proxy failures are not address specific, so they stop candidate retries.
    pub fn is_proxy_error(self) -> bool {
        matches!(
            self,
            SocketErrorKind::ProxyAuthenticationRequired
                | SocketErrorKind::ProxyConnectionRefused
                | SocketErrorKind::ProxyConnectionClosed
                | SocketErrorKind::ProxyConnectionTimeout
                | SocketErrorKind::ProxyNotFound
                | SocketErrorKind::ProxyProtocol
        )
    }

    /// Errors that may be reported without any state change.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            SocketErrorKind::UnfinishedSocketOperation | SocketErrorKind::TemporaryError
        )
    }

    /// Message used when an error of this kind is raised without OS detail.
    pub fn default_message(self) -> &'static str {
        match self {
            SocketErrorKind::ConnectionRefused => "Connection refused",
            SocketErrorKind::RemoteHostClosed => "The remote host closed the connection",
            SocketErrorKind::HostNotFound => "Host not found",
            SocketErrorKind::SocketAccess => "Permission denied",
            SocketErrorKind::SocketResource => "Out of resources",
            SocketErrorKind::SocketTimeout => "Network operation timed out",
            SocketErrorKind::DatagramTooLarge => "Datagram was too large to send",
            SocketErrorKind::Network => "Network error",
            SocketErrorKind::AddressInUse => "The bound address is already in use",
            SocketErrorKind::SocketAddressNotAvailable => "The address is not available",
            SocketErrorKind::UnsupportedSocketOperation => "Unsupported socket operation",
            SocketErrorKind::UnfinishedSocketOperation => "Operation in progress",
            SocketErrorKind::ProxyAuthenticationRequired => "Proxy requires authentication",
            SocketErrorKind::ProxyConnectionRefused => "Proxy connection refused",
            SocketErrorKind::ProxyConnectionClosed => "Proxy connection closed prematurely",
            SocketErrorKind::ProxyConnectionTimeout => "Proxy server connection timed out",
            SocketErrorKind::ProxyNotFound => "Proxy server not found",
            SocketErrorKind::ProxyProtocol => "Error communicating with HTTP proxy",
            SocketErrorKind::OperationError => "Operation not permitted in the current state",
            SocketErrorKind::TemporaryError => "Temporary error",
            SocketErrorKind::Unknown => "Unknown error",
        }
    }
}

/// A socket error: kind plus message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SocketError {
    pub kind: SocketErrorKind,
    pub message: String,
}

impl SocketError {
    pub fn new(kind: SocketErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error of `kind` carrying its default message.
    pub fn from_kind(kind: SocketErrorKind) -> Self {
        Self::new(kind, kind.default_message())
    }

    pub fn is_proxy_error(&self) -> bool {
        self.kind.is_proxy_error()
    }
}

impl From<SocketErrorKind> for SocketError {
    fn from(kind: SocketErrorKind) -> Self {
        Self::from_kind(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_classification() {
        assert!(SocketErrorKind::ProxyProtocol.is_proxy_error());
        assert!(SocketErrorKind::ProxyNotFound.is_proxy_error());
        assert!(!SocketErrorKind::ConnectionRefused.is_proxy_error());
        assert!(!SocketErrorKind::SocketAccess.is_proxy_error());
    }

    #[test]
    fn test_transient_kinds() {
        assert!(SocketErrorKind::TemporaryError.is_transient());
        assert!(SocketErrorKind::UnfinishedSocketOperation.is_transient());
        assert!(!SocketErrorKind::Network.is_transient());
    }

    #[test]
    fn test_display_uses_message() {
        let err = SocketError::new(SocketErrorKind::Network, "Host unreachable");
        assert_eq!(err.to_string(), "Host unreachable");
        assert_eq!(
            SocketError::from(SocketErrorKind::HostNotFound).to_string(),
            "Host not found"
        );
    }
}
