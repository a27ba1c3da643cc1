//! errno to [`SocketError`] translation, one function per system call.

use std::io;

use crate::engine::SocketState;
use crate::error::{SocketError, SocketErrorKind as Kind};

pub(super) const NON_BLOCKING_INIT_FAILED: &str = "Unable to initialize non-blocking socket";
pub(super) const BROADCASTING_INIT_FAILED: &str = "Unable to initialize broadcast socket";
pub(super) const PROTOCOL_UNSUPPORTED: &str = "Protocol type not supported";
pub(super) const INVALID_SOCKET: &str = "Invalid socket descriptor";
pub(super) const HOST_UNREACHABLE: &str = "Host unreachable";
pub(super) const NETWORK_UNREACHABLE: &str = "Network unreachable";
pub(super) const ACCESS: &str = "Permission denied";
pub(super) const CONNECTION_TIMED_OUT: &str = "Connection timed out";
pub(super) const CONNECTION_REFUSED: &str = "Connection refused";
pub(super) const ADDRESS_IN_USE: &str = "The bound address is already in use";
pub(super) const ADDRESS_NOT_AVAILABLE: &str = "The address is not available";
pub(super) const ADDRESS_PROTECTED: &str = "The address is protected";
pub(super) const DATAGRAM_TOO_LARGE: &str = "Datagram was too large to send";
pub(super) const SEND_DATAGRAM: &str = "Unable to send a message";
pub(super) const RECEIVE_DATAGRAM: &str = "Unable to receive a message";
pub(super) const REMOTE_HOST_CLOSED: &str = "The remote host closed the connection";
pub(super) const TIME_OUT: &str = "Network operation timed out";
pub(super) const RESOURCE: &str = "Out of resources";
pub(super) const OPERATION_UNSUPPORTED: &str = "Unsupported socket operation";
pub(super) const PORT_IN_USE: &str = "Another socket is already listening on the same port";
pub(super) const NOT_SOCKET: &str = "Operation on non-socket";
pub(super) const UNKNOWN: &str = "Unknown error";

pub(super) fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}

fn os_message(err: &io::Error) -> String {
    err.to_string()
}

/// `socket(2)` failures.
pub(super) fn create_error(err: &io::Error) -> SocketError {
    match errno_of(err) {
        libc::EPROTONOSUPPORT | libc::EAFNOSUPPORT | libc::EINVAL => {
            SocketError::new(Kind::UnsupportedSocketOperation, PROTOCOL_UNSUPPORTED)
        }
        libc::ENFILE | libc::EMFILE | libc::ENOBUFS | libc::ENOMEM => {
            SocketError::new(Kind::SocketResource, RESOURCE)
        }
        libc::EACCES => SocketError::new(Kind::SocketAccess, ACCESS),
        _ => SocketError::new(Kind::Unknown, os_message(err)),
    }
}

/// `bind(2)` failures.
pub(super) fn bind_error(err: &io::Error) -> SocketError {
    match errno_of(err) {
        libc::EADDRINUSE => SocketError::new(Kind::AddressInUse, ADDRESS_IN_USE),
        libc::EACCES => SocketError::new(Kind::SocketAccess, ADDRESS_PROTECTED),
        libc::EINVAL => SocketError::new(Kind::UnsupportedSocketOperation, OPERATION_UNSUPPORTED),
        libc::EADDRNOTAVAIL => {
            SocketError::new(Kind::SocketAddressNotAvailable, ADDRESS_NOT_AVAILABLE)
        }
        _ => SocketError::new(Kind::Unknown, os_message(err)),
    }
}

/// What a failed `connect(2)` means for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum ConnectErrno {
    /// Already connected (`EISCONN`).
    Connected,
    /// Still connecting (`EINPROGRESS`, `EALREADY`, `EAGAIN`, `EINTR`).
    InProgress,
    Failed(SocketError, SocketState),
}

pub(super) fn connect_outcome(err: &io::Error) -> ConnectErrno {
    let unconnected = SocketState::Unconnected;
    match errno_of(err) {
        libc::EISCONN => ConnectErrno::Connected,
        libc::EINPROGRESS | libc::EALREADY | libc::EAGAIN | libc::EINTR => ConnectErrno::InProgress,
        libc::ECONNREFUSED | libc::EINVAL => ConnectErrno::Failed(
            SocketError::new(Kind::ConnectionRefused, CONNECTION_REFUSED),
            unconnected,
        ),
        libc::ETIMEDOUT => ConnectErrno::Failed(
            SocketError::new(Kind::SocketTimeout, CONNECTION_TIMED_OUT),
            unconnected,
        ),
        libc::EHOSTUNREACH => ConnectErrno::Failed(
            SocketError::new(Kind::Network, HOST_UNREACHABLE),
            unconnected,
        ),
        libc::ENETUNREACH => ConnectErrno::Failed(
            SocketError::new(Kind::Network, NETWORK_UNREACHABLE),
            unconnected,
        ),
        libc::EADDRINUSE => ConnectErrno::Failed(
            SocketError::new(Kind::AddressInUse, ADDRESS_IN_USE),
            unconnected,
        ),
        libc::EACCES | libc::EPERM => {
            ConnectErrno::Failed(SocketError::new(Kind::SocketAccess, ACCESS), unconnected)
        }
        _ => ConnectErrno::Failed(SocketError::new(Kind::Unknown, os_message(err)), unconnected),
    }
}

pub(super) fn listen_error(err: &io::Error) -> SocketError {
    match errno_of(err) {
        libc::EADDRINUSE => SocketError::new(Kind::AddressInUse, PORT_IN_USE),
        _ => SocketError::new(Kind::Unknown, os_message(err)),
    }
}

/// `accept(2)` failures. `None` means the queue is merely empty.
pub(super) fn accept_error(err: &io::Error) -> Option<SocketError> {
    let errno = errno_of(err);
    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
        return None;
    }
    Some(match errno {
        libc::EBADF | libc::EOPNOTSUPP => {
            SocketError::new(Kind::UnsupportedSocketOperation, INVALID_SOCKET)
        }
        libc::ECONNABORTED => SocketError::new(Kind::Network, REMOTE_HOST_CLOSED),
        libc::EFAULT | libc::ENOTSOCK => SocketError::new(Kind::SocketResource, NOT_SOCKET),
        libc::EPROTONOSUPPORT | libc::EPROTO | libc::EAFNOSUPPORT | libc::EINVAL => {
            SocketError::new(Kind::UnsupportedSocketOperation, PROTOCOL_UNSUPPORTED)
        }
        libc::ENFILE | libc::EMFILE | libc::ENOBUFS | libc::ENOMEM => {
            SocketError::new(Kind::SocketResource, RESOURCE)
        }
        libc::EACCES | libc::EPERM => SocketError::new(Kind::SocketAccess, ACCESS),
        _ => SocketError::new(Kind::Unknown, UNKNOWN),
    })
}

/// Stream read failures. `ECONNRESET` counts as a remote close.
pub(super) fn read_error(err: &io::Error) -> SocketError {
    match errno_of(err) {
        libc::ECONNRESET => SocketError::new(Kind::RemoteHostClosed, REMOTE_HOST_CLOSED),
        libc::ETIMEDOUT => SocketError::new(Kind::SocketTimeout, os_message(err)),
        _ => SocketError::new(Kind::Network, os_message(err)),
    }
}

/// Stream write failures. `None` for would-block.
pub(super) fn write_error(err: &io::Error) -> Option<SocketError> {
    match errno_of(err) {
        errno if is_would_block(errno) => None,
        libc::EPIPE | libc::ECONNRESET => {
            Some(SocketError::new(Kind::RemoteHostClosed, REMOTE_HOST_CLOSED))
        }
        libc::EMSGSIZE => Some(SocketError::new(Kind::DatagramTooLarge, DATAGRAM_TOO_LARGE)),
        _ => Some(SocketError::new(Kind::Network, os_message(err))),
    }
}

/// Whether a write error leaves the socket unusable.
pub(super) fn write_error_closes(err: &SocketError) -> bool {
    err.kind == Kind::RemoteHostClosed
}

pub(super) fn receive_datagram_error(errno: i32) -> SocketError {
    match errno {
        libc::ECONNREFUSED => SocketError::new(Kind::ConnectionRefused, CONNECTION_REFUSED),
        _ => SocketError::new(Kind::Network, RECEIVE_DATAGRAM),
    }
}

pub(super) fn send_datagram_error(errno: i32) -> SocketError {
    match errno {
        libc::EMSGSIZE => SocketError::new(Kind::DatagramTooLarge, DATAGRAM_TOO_LARGE),
        libc::ECONNRESET => SocketError::new(Kind::RemoteHostClosed, REMOTE_HOST_CLOSED),
        _ => SocketError::new(Kind::Network, SEND_DATAGRAM),
    }
}

pub(super) fn multicast_error(errno: i32) -> SocketError {
    match errno {
        libc::ENOPROTOOPT => SocketError::new(Kind::UnsupportedSocketOperation, OPERATION_UNSUPPORTED),
        libc::EADDRNOTAVAIL => {
            SocketError::new(Kind::SocketAddressNotAvailable, ADDRESS_NOT_AVAILABLE)
        }
        _ => SocketError::new(Kind::Unknown, UNKNOWN),
    }
}

pub(super) fn is_would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(errno: i32) -> io::Error {
        io::Error::from_raw_os_error(errno)
    }

    #[test]
    fn test_connect_mapping() {
        assert_eq!(connect_outcome(&os(libc::EISCONN)), ConnectErrno::Connected);
        assert_eq!(connect_outcome(&os(libc::EINPROGRESS)), ConnectErrno::InProgress);
        assert_eq!(connect_outcome(&os(libc::EALREADY)), ConnectErrno::InProgress);
        assert_eq!(connect_outcome(&os(libc::EAGAIN)), ConnectErrno::InProgress);

        let kind_of = |errno| match connect_outcome(&os(errno)) {
            ConnectErrno::Failed(err, state) => {
                assert_eq!(state, SocketState::Unconnected);
                err.kind
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(kind_of(libc::ECONNREFUSED), Kind::ConnectionRefused);
        assert_eq!(kind_of(libc::EINVAL), Kind::ConnectionRefused);
        assert_eq!(kind_of(libc::ETIMEDOUT), Kind::SocketTimeout);
        assert_eq!(kind_of(libc::EHOSTUNREACH), Kind::Network);
        assert_eq!(kind_of(libc::ENETUNREACH), Kind::Network);
        assert_eq!(kind_of(libc::EACCES), Kind::SocketAccess);
        assert_eq!(kind_of(libc::EPERM), Kind::SocketAccess);
    }

    #[test]
    fn test_bind_mapping() {
        assert_eq!(bind_error(&os(libc::EADDRINUSE)).kind, Kind::AddressInUse);
        assert_eq!(bind_error(&os(libc::EACCES)).message, ADDRESS_PROTECTED);
        assert_eq!(
            bind_error(&os(libc::EADDRNOTAVAIL)).kind,
            Kind::SocketAddressNotAvailable
        );
    }

    #[test]
    fn test_create_mapping() {
        assert_eq!(create_error(&os(libc::EMFILE)).kind, Kind::SocketResource);
        assert_eq!(
            create_error(&os(libc::EPROTONOSUPPORT)).kind,
            Kind::UnsupportedSocketOperation
        );
    }

    #[test]
    fn test_accept_would_block_is_not_an_error() {
        assert!(accept_error(&os(libc::EAGAIN)).is_none());
        assert_eq!(accept_error(&os(libc::EMFILE)).unwrap().kind, Kind::SocketResource);
    }

    #[test]
    fn test_write_mapping() {
        assert!(write_error(&os(libc::EAGAIN)).is_none());
        let err = write_error(&os(libc::EPIPE)).unwrap();
        assert!(write_error_closes(&err));
        assert_eq!(write_error(&os(libc::EMSGSIZE)).unwrap().kind, Kind::DatagramTooLarge);
    }

    #[test]
    fn test_read_reset_is_remote_close() {
        assert_eq!(read_error(&os(libc::ECONNRESET)).kind, Kind::RemoteHostClosed);
        assert_eq!(read_error(&os(libc::EIO)).kind, Kind::Network);
    }
}
