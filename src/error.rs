//! The flat error namespace shared by every part of the runtime.
//!
//! Errors travel through callbacks rather than unwinding: a failure on an
//! active channel shows up as the argument of the shutdown callback, a
//! failure during connection setup as the argument of the setup callback.
//! Every variant maps to a stable integer code via [`Error::code`] so
//! callers can record and compare failures across process boundaries.

use std::io;
use std::sync::Arc;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All failures surfaced by the runtime.
///
/// The enum is cheap to clone; I/O causes carry their [`io::Error`] behind
/// an `Arc` because the same failure is often reported to several
/// callbacks (setup, message completions, shutdown).
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer closed the connection, or the socket was closed locally
    /// while an operation was outstanding.
    #[error("socket is closed")]
    SocketClosed,

    /// A socket-level timer fired before the operation finished, e.g. a
    /// connect that never completed.
    #[error("socket operation timed out")]
    SocketTimeout,

    /// The non-blocking connect finished with an error.
    #[error("socket connect failure: {0}")]
    SocketConnectFailure(#[source] Arc<io::Error>),

    /// Host name resolution failed.
    #[error("host resolution failed: {0}")]
    DnsQueryFailure(#[source] Arc<io::Error>),

    /// The file descriptor is already subscribed to this event loop.
    #[error("file descriptor is already subscribed")]
    AlreadySubscribed,

    /// The operation is only valid on the owning event loop's thread.
    #[error("operation must run on the event loop thread")]
    OffEventLoopThread,

    /// The event loop rejected the operation because it is shutting down
    /// or has already been joined.
    #[error("event loop has shut down")]
    EventLoopShutdown,

    /// The event loop is not in a state where it can be started.
    #[error("event loop is not in a runnable state")]
    InvalidLoopState,

    /// The channel has completed shutdown and no longer accepts work.
    #[error("channel has shut down")]
    ChannelShutdown,

    /// Delivering the message upstream would underflow the receiving
    /// slot's read window.
    #[error("read would exceed the downstream window")]
    ReadWindowExceeded,

    /// A statistics observer can only be installed before the channel
    /// performs I/O.
    #[error("statistics observer must be installed before first I/O")]
    StatisticsObserverTooLate,

    /// TLS negotiation did not finish within the configured timeout.
    #[error("TLS negotiation timed out")]
    TlsNegotiationTimeout,

    /// The TLS provider reported a handshake or record-layer failure.
    #[error("TLS negotiation failure: {0}")]
    TlsNegotiationFailure(Arc<str>),

    /// The peer sent a fatal TLS alert.
    #[error("TLS alert received from peer")]
    TlsAlertReceived,

    /// Building a TLS context from the supplied options failed.
    #[error("TLS context construction failed: {0}")]
    TlsContextFailure(Arc<str>),

    /// The active TLS provider does not implement the requested option.
    #[error("operation is not supported by the TLS provider")]
    TlsProviderUnsupported,

    /// An uncategorized I/O failure.
    #[error("i/o error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl Error {
    /// Returns the stable integer code for this error.
    ///
    /// Codes are append-only: new variants take new numbers and existing
    /// numbers are never reused.
    pub fn code(&self) -> u32 {
        match self {
            Error::SocketClosed => 1,
            Error::SocketTimeout => 2,
            Error::SocketConnectFailure(_) => 3,
            Error::DnsQueryFailure(_) => 4,
            Error::AlreadySubscribed => 5,
            Error::OffEventLoopThread => 6,
            Error::EventLoopShutdown => 7,
            Error::InvalidLoopState => 8,
            Error::ChannelShutdown => 9,
            Error::ReadWindowExceeded => 10,
            Error::StatisticsObserverTooLate => 11,
            Error::TlsNegotiationTimeout => 100,
            Error::TlsNegotiationFailure(_) => 101,
            Error::TlsAlertReceived => 102,
            Error::TlsContextFailure(_) => 103,
            Error::TlsProviderUnsupported => 104,
            Error::Io(_) => 1000,
        }
    }

    /// Returns true if the error originated in the TLS layer.
    pub fn is_tls(&self) -> bool {
        matches!(
            self,
            Error::TlsNegotiationTimeout
                | Error::TlsNegotiationFailure(_)
                | Error::TlsAlertReceived
                | Error::TlsContextFailure(_)
                | Error::TlsProviderUnsupported
        )
    }

    /// Classifies an [`io::Error`] coming off a socket.
    ///
    /// Disconnect-shaped kinds collapse into [`Error::SocketClosed`] so
    /// callers see one stable code for "the peer went away" regardless of
    /// which syscall noticed first.
    pub(crate) fn from_socket_io(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => Error::SocketClosed,
            io::ErrorKind::TimedOut => Error::SocketTimeout,
            _ => Error::Io(Arc::new(err)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use std::collections::HashSet;
    use std::io;
    use std::sync::Arc;

    #[test]
    fn codes_are_unique() {
        let errors = [
            Error::SocketClosed,
            Error::SocketTimeout,
            Error::SocketConnectFailure(Arc::new(io::Error::other("x"))),
            Error::DnsQueryFailure(Arc::new(io::Error::other("x"))),
            Error::AlreadySubscribed,
            Error::OffEventLoopThread,
            Error::EventLoopShutdown,
            Error::InvalidLoopState,
            Error::ChannelShutdown,
            Error::ReadWindowExceeded,
            Error::StatisticsObserverTooLate,
            Error::TlsNegotiationTimeout,
            Error::TlsNegotiationFailure(Arc::from("x")),
            Error::TlsAlertReceived,
            Error::TlsContextFailure(Arc::from("x")),
            Error::TlsProviderUnsupported,
            Error::Io(Arc::new(io::Error::other("x"))),
        ];
        let codes: HashSet<u32> = errors.iter().map(Error::code).collect();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn tls_classification() {
        assert!(Error::TlsNegotiationTimeout.is_tls());
        assert!(Error::TlsNegotiationFailure(Arc::from("handshake")).is_tls());
        assert!(!Error::SocketClosed.is_tls());
        assert!(!Error::Io(Arc::new(io::Error::other("x"))).is_tls());
    }

    #[test]
    fn disconnects_collapse_to_socket_closed() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
        ] {
            let err = Error::from_socket_io(io::Error::from(kind));
            assert!(matches!(err, Error::SocketClosed));
        }
    }
}
