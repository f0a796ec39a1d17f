use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

use crate::net::SocketOptions;
use crate::sys;

/// A non-blocking TCP socket.
///
/// The socket is closed when the value is dropped; callers that
/// subscribed the fd with an event loop must unsubscribe first.
#[derive(Debug)]
pub(crate) struct TcpSock {
    inner: Socket,
}

impl TcpSock {
    /// Creates a non-blocking socket and issues a connect to `addr`.
    ///
    /// An in-progress connect is not an error; completion is observed as
    /// write readiness, after which [`TcpSock::take_error`] tells
    /// success from failure.
    pub(crate) fn connect(addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpSock> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        let sock = TcpSock { inner: socket };
        sock.apply_options(options)?;

        match sock.inner.connect(&addr.into()) {
            Ok(()) => {}
            Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) => return Err(err),
        }
        Ok(sock)
    }

    /// Binds `addr` and starts listening.
    pub(crate) fn listen(
        addr: SocketAddr,
        options: &SocketOptions,
        backlog: i32,
    ) -> io::Result<TcpSock> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        let sock = TcpSock { inner: socket };
        sock.apply_options(options)?;
        sock.inner.bind(&addr.into())?;
        sock.inner.listen(backlog)?;
        Ok(sock)
    }

    /// Accepts one pending connection, returning it in non-blocking
    /// mode with the listener's options applied.
    pub(crate) fn accept(&self, options: &SocketOptions) -> io::Result<(TcpSock, SocketAddr)> {
        let (socket, addr) = self.inner.accept()?;
        socket.set_nonblocking(true)?;
        let sock = TcpSock { inner: socket };
        sock.apply_options(options)?;
        let addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::other("accepted a non-inet address"))?;
        Ok((sock, addr))
    }

    fn apply_options(&self, options: &SocketOptions) -> io::Result<()> {
        let fd = self.as_raw_fd();
        if options.tcp_nodelay {
            sys::socket::set_tcp_nodelay(fd, true)?;
        }
        if options.keepalive.is_some() {
            sys::socket::set_keepalive(fd, options.keepalive, options.keepalive_interval)?;
        }
        if options.linger.is_some() {
            sys::socket::set_linger(fd, options.linger)?;
        }
        Ok(())
    }

    /// The pending socket error, if any. Used to resolve a non-blocking
    /// connect once the fd reports writability.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }

    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    pub(crate) fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("socket bound to a non-inet address"))
    }
}

impl AsRawFd for TcpSock {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
