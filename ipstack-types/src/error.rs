//! The single internal error type. Converted to POSIX errno at the socket
//! syscall boundary via [`NetError::to_errno`].

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetError {
    /// Operation would block (EAGAIN / EWOULDBLOCK).
    WouldBlock,
    /// Connection refused by remote host (ECONNREFUSED).
    ConnectionRefused,
    /// Connection reset by remote host (ECONNRESET).
    ConnectionReset,
    /// Connection aborted locally (ECONNABORTED).
    ConnectionAborted,
    /// Operation timed out (ETIMEDOUT).
    TimedOut,
    /// Address already in use (EADDRINUSE).
    AddressInUse,
    /// Requested address not available on this host (EADDRNOTAVAIL).
    AddressNotAvailable,
    /// Socket is not connected (ENOTCONN).
    NotConnected,
    /// Socket is already connected (EISCONN).
    AlreadyConnected,
    /// Network is unreachable (ENETUNREACH).
    NetworkUnreachable,
    /// Host is unreachable (EHOSTUNREACH).
    HostUnreachable,
    /// Permission denied (EPERM).
    PermissionDenied,
    /// Invalid argument (EINVAL).
    InvalidArgument,
    /// No buffer space available (ENOBUFS).
    NoBufferSpace,
    /// Address family not supported (EAFNOSUPPORT).
    AddressFamilyNotSupported,
    /// Socket not bound — `bind()` was not called (EINVAL).
    SocketNotBound,
    /// Non-blocking connect in progress (EINPROGRESS).
    InProgress,
    /// Operation not supported on this socket type (EOPNOTSUPP).
    OperationNotSupported,
    /// Write after shutdown (EPIPE).
    Shutdown,
    /// ARP query exceeded its deadline (ETIMEDOUT, distinguished internally
    /// from a TCP retransmission timeout for logging purposes).
    ArpTimeout,
    /// No route to the destination exists in the routing table (ENETUNREACH).
    NoRoute,
    /// A bounded send queue (IP egress, per-device tx) rejected a packet
    /// because it is full (ENOBUFS).
    SendQueueFull,
    /// A checksum validation failed; the segment/packet is dropped silently
    /// by the caller, this variant exists for internal logging.
    ChecksumMismatch,
    /// A header failed structural validation (short buffer, bad version).
    BadHeader,
    /// An operation was attempted in a TCP state that forbids it.
    WrongState,
    /// A listening socket's accept backlog is full (ECONNREFUSED at the peer).
    BacklogFull,
    /// A TCB exhausted its retransmission budget without an ACK.
    RetransmitLimitExceeded,
    /// The requested local port is already bound (EADDRINUSE).
    PortInUse,
    /// A device, route, or listener with this identity already exists.
    AlreadyRegistered,
}

impl NetError {
    /// Convert to a POSIX errno value (negative) for the syscall boundary.
    pub const fn to_errno(&self) -> i32 {
        match self {
            Self::WouldBlock => -11,                 // EAGAIN
            Self::ConnectionRefused => -111,          // ECONNREFUSED
            Self::ConnectionReset => -104,             // ECONNRESET
            Self::ConnectionAborted => -103,           // ECONNABORTED
            Self::TimedOut => -110,                    // ETIMEDOUT
            Self::AddressInUse => -98,                 // EADDRINUSE
            Self::AddressNotAvailable => -99,          // EADDRNOTAVAIL
            Self::NotConnected => -107,                // ENOTCONN
            Self::AlreadyConnected => -106,            // EISCONN
            Self::NetworkUnreachable => -101,          // ENETUNREACH
            Self::HostUnreachable => -113,             // EHOSTUNREACH
            Self::PermissionDenied => -1,              // EPERM
            Self::InvalidArgument => -22,               // EINVAL
            Self::NoBufferSpace => -105,                // ENOBUFS
            Self::AddressFamilyNotSupported => -97,    // EAFNOSUPPORT
            Self::SocketNotBound => -22,                // EINVAL
            Self::InProgress => -115,                   // EINPROGRESS
            Self::OperationNotSupported => -95,        // EOPNOTSUPP
            Self::Shutdown => -32,                      // EPIPE
            Self::ArpTimeout => -110,                   // ETIMEDOUT
            Self::NoRoute => -101,                      // ENETUNREACH
            Self::SendQueueFull => -105,                // ENOBUFS
            Self::ChecksumMismatch => -22,               // EINVAL
            Self::BadHeader => -22,                      // EINVAL
            Self::WrongState => -22,                     // EINVAL
            Self::BacklogFull => -111,                   // ECONNREFUSED
            Self::RetransmitLimitExceeded => -110,      // ETIMEDOUT
            Self::PortInUse => -98,                      // EADDRINUSE
            Self::AlreadyRegistered => -98,              // EADDRINUSE
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "operation would block"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::ConnectionReset => write!(f, "connection reset by peer"),
            Self::ConnectionAborted => write!(f, "connection aborted"),
            Self::TimedOut => write!(f, "operation timed out"),
            Self::AddressInUse => write!(f, "address already in use"),
            Self::AddressNotAvailable => write!(f, "address not available"),
            Self::NotConnected => write!(f, "socket not connected"),
            Self::AlreadyConnected => write!(f, "socket already connected"),
            Self::NetworkUnreachable => write!(f, "network unreachable"),
            Self::HostUnreachable => write!(f, "host unreachable"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NoBufferSpace => write!(f, "no buffer space available"),
            Self::AddressFamilyNotSupported => write!(f, "address family not supported"),
            Self::SocketNotBound => write!(f, "socket not bound"),
            Self::InProgress => write!(f, "operation in progress"),
            Self::OperationNotSupported => write!(f, "operation not supported"),
            Self::Shutdown => write!(f, "broken pipe (shutdown)"),
            Self::ArpTimeout => write!(f, "arp query timed out"),
            Self::NoRoute => write!(f, "no route to host"),
            Self::SendQueueFull => write!(f, "send queue full"),
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::BadHeader => write!(f, "malformed header"),
            Self::WrongState => write!(f, "operation invalid in current state"),
            Self::BacklogFull => write!(f, "accept backlog full"),
            Self::RetransmitLimitExceeded => write!(f, "retransmission limit exceeded"),
            Self::PortInUse => write!(f, "port already in use"),
            Self::AlreadyRegistered => write!(f, "already registered"),
        }
    }
}

impl std::error::Error for NetError {}
