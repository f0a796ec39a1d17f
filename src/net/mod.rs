//! Non-blocking TCP primitives the socket handler and bootstrap build on.

mod tcp;

pub(crate) use self::tcp::TcpSock;

use std::time::Duration;

/// Options applied to sockets created by the bootstrap.
#[derive(Clone, Debug)]
pub struct SocketOptions {
    /// How long a non-blocking connect may stay outstanding before the
    /// attempt fails with `SocketTimeout`. `None` disables the timer.
    pub connect_timeout: Option<Duration>,
    /// Enables TCP keepalive with the given idle time.
    pub keepalive: Option<Duration>,
    /// Probe interval used together with `keepalive`.
    pub keepalive_interval: Option<Duration>,
    /// Disables Nagle's algorithm.
    pub tcp_nodelay: bool,
    /// SO_LINGER duration applied on close.
    pub linger: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> SocketOptions {
        SocketOptions {
            connect_timeout: Some(Duration::from_secs(3)),
            keepalive: None,
            keepalive_interval: None,
            tcp_nodelay: false,
            linger: None,
        }
    }
}
