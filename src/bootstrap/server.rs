use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::{Channel, ChannelOptions, SocketHandler};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, EventLoopGroup};
use crate::interest::Interest;
use crate::net::{SocketOptions, TcpSock};
use crate::task::{Task, TaskStatus};
use crate::tls::{TlsConnectionOptions, TlsHandler};

type IncomingCallback = Arc<dyn Fn(Result<Channel>) + Send + Sync>;
type ChannelShutdownCallback = Arc<dyn Fn(Channel, Result<()>) + Send + Sync>;
type DestroyCallback = Box<dyn FnOnce() + Send>;

/// Options for [`ServerBootstrap::listen`].
pub struct ServerListenerOptions {
    host: String,
    port: u16,
    socket_options: SocketOptions,
    tls: Option<TlsConnectionOptions>,
    enable_read_back_pressure: bool,
    on_incoming: Option<IncomingCallback>,
    on_channel_shutdown: Option<ChannelShutdownCallback>,
    on_destroy: Option<DestroyCallback>,
}

impl ServerListenerOptions {
    /// Options binding `host:port` with default socket options and no
    /// TLS.
    pub fn new(host: impl Into<String>, port: u16) -> ServerListenerOptions {
        ServerListenerOptions {
            host: host.into(),
            port,
            socket_options: SocketOptions::default(),
            tls: None,
            enable_read_back_pressure: false,
            on_incoming: None,
            on_channel_shutdown: None,
            on_destroy: None,
        }
    }

    /// Socket options for the listener and every accepted socket.
    pub fn socket_options(mut self, options: SocketOptions) -> ServerListenerOptions {
        self.socket_options = options;
        self
    }

    /// Terminates TLS on every accepted channel.
    pub fn tls(mut self, options: TlsConnectionOptions) -> ServerListenerOptions {
        self.tls = Some(options);
        self
    }

    /// Enables per-slot read windows on accepted channels.
    pub fn enable_read_back_pressure(mut self, enable: bool) -> ServerListenerOptions {
        self.enable_read_back_pressure = enable;
        self
    }

    /// Fired on the accepted channel's loop once its setup (including
    /// TLS negotiation) resolves: `Ok(channel)` ready for handlers, or
    /// the per-connection failure.
    pub fn on_incoming<F>(mut self, f: F) -> ServerListenerOptions
    where
        F: Fn(Result<Channel>) + Send + Sync + 'static,
    {
        self.on_incoming = Some(Arc::new(f));
        self
    }

    /// Fired when a successfully set-up accepted channel finishes
    /// shutdown.
    pub fn on_channel_shutdown<F>(mut self, f: F) -> ServerListenerOptions
    where
        F: Fn(Channel, Result<()>) + Send + Sync + 'static,
    {
        self.on_channel_shutdown = Some(Arc::new(f));
        self
    }

    /// Fired once the listener's accept loop has drained after
    /// [`Listener::destroy`].
    pub fn on_destroy<F>(mut self, f: F) -> ServerListenerOptions
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_destroy = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for ServerListenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerListenerOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Accepts connections and composes a channel per accepted socket, each
/// placed round-robin on the group's loops.
#[derive(Clone)]
pub struct ServerBootstrap {
    group: EventLoopGroup,
}

impl ServerBootstrap {
    /// A bootstrap over `group`.
    pub fn new(group: &EventLoopGroup) -> ServerBootstrap {
        ServerBootstrap {
            group: group.clone(),
        }
    }

    /// Binds and listens, accepting on one of the group's loops.
    /// Returns synchronously with the bound listener; per-connection
    /// results arrive through the options' callbacks.
    pub fn listen(&self, options: ServerListenerOptions) -> Result<Listener> {
        let ServerListenerOptions {
            host,
            port,
            socket_options,
            tls,
            enable_read_back_pressure,
            on_incoming,
            on_channel_shutdown,
            on_destroy,
        } = options;

        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|err| Error::DnsQueryFailure(Arc::new(err)))?
            .next()
            .ok_or_else(|| {
                Error::DnsQueryFailure(Arc::new(std::io::Error::other("no addresses returned")))
            })?;
        let sock = TcpSock::listen(addr, &socket_options, 128)?;
        let local_addr = sock.local_addr()?;
        let fd = sock.as_raw_fd();
        let event_loop = self.group.next_loop();
        let shared = Arc::new(ListenerShared {
            destroyed: AtomicBool::new(false),
            on_destroy: Mutex::new(on_destroy),
        });

        let accept = Accept {
            group: self.group.clone(),
            socket_options,
            tls,
            enable_read_back_pressure,
            on_incoming: on_incoming.unwrap_or_else(|| Arc::new(|_| {})),
            on_channel_shutdown,
        };
        let sub_loop = event_loop.clone();
        let task = Task::new("listener-start", move |status: TaskStatus| {
            if status == TaskStatus::Canceled {
                return;
            }
            let subscribed = sub_loop.subscribe(fd, Interest::READABLE, move |_, _| {
                accept_pending(&sock, &accept);
            });
            if let Err(err) = subscribed {
                error!("listener on fd {} failed to subscribe: {}", fd, err);
            }
        });
        if let Err(rejected) = event_loop.schedule_internal(task, None) {
            return Err(rejected.error);
        }

        trace!("listening on {}", local_addr);
        Ok(Listener {
            event_loop,
            local_addr,
            fd,
            shared,
        })
    }
}

impl fmt::Debug for ServerBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBootstrap")
            .field("group", &self.group)
            .finish()
    }
}

struct Accept {
    group: EventLoopGroup,
    socket_options: SocketOptions,
    tls: Option<TlsConnectionOptions>,
    enable_read_back_pressure: bool,
    on_incoming: IncomingCallback,
    on_channel_shutdown: Option<ChannelShutdownCallback>,
}

fn accept_pending(sock: &TcpSock, accept: &Accept) {
    loop {
        match sock.accept(&accept.socket_options) {
            Ok((conn, peer)) => {
                debug!("accepted connection from {}", peer);
                spawn_incoming(conn, accept);
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("accept failed: {}", err);
                return;
            }
        }
    }
}

/// Builds a channel for one accepted socket on a round-robin loop, with
/// the server-side handler flow: socket handler, then TLS when
/// configured, then the incoming callback.
fn spawn_incoming(conn: TcpSock, accept: &Accept) {
    let target = accept.group.next_loop();
    let tls = accept.tls.clone();
    let on_incoming = Arc::clone(&accept.on_incoming);
    let on_channel_shutdown = accept.on_channel_shutdown.clone();
    let setup_succeeded = Arc::new(AtomicBool::new(false));

    let setup_flag = Arc::clone(&setup_succeeded);
    let options = ChannelOptions::new()
        .enable_read_back_pressure(accept.enable_read_back_pressure)
        .on_setup_completed(move |result| {
            let channel = match result {
                Ok(channel) => channel,
                Err(err) => {
                    on_incoming(Err(err));
                    return;
                }
            };
            if let Err(err) = SocketHandler::install(&channel, conn) {
                on_incoming(Err(err.clone()));
                channel.force_shutdown(Some(err));
                return;
            }
            match tls {
                None => {
                    setup_flag.store(true, Ordering::Release);
                    on_incoming(Ok(channel.clone()));
                }
                Some(tls_options) => {
                    let negotiated_channel = channel.clone();
                    let negotiated_flag = Arc::clone(&setup_flag);
                    let negotiated_incoming = Arc::clone(&on_incoming);
                    let installed =
                        TlsHandler::install_server(&channel, &tls_options, move |result| {
                            match result {
                                Ok(_) => {
                                    negotiated_flag.store(true, Ordering::Release);
                                    negotiated_incoming(Ok(negotiated_channel.clone()));
                                }
                                Err(err) => negotiated_incoming(Err(err)),
                            }
                        });
                    if let Err(err) = installed {
                        channel.force_shutdown(Some(err));
                    }
                }
            }
        })
        .on_shutdown_completed(move |channel, result| {
            if setup_succeeded.load(Ordering::Acquire) {
                if let Some(cb) = &on_channel_shutdown {
                    cb(channel, result);
                }
            }
        });
    Channel::new(&target, options);
}

struct ListenerShared {
    destroyed: AtomicBool,
    on_destroy: Mutex<Option<DestroyCallback>>,
}

/// Handle to a bound, accepting listener.
///
/// Destruction is asynchronous: [`Listener::destroy`] posts a task to
/// the accept loop, which unsubscribes and closes the socket and then
/// fires the destroy callback. Channels already accepted are unaffected.
pub struct Listener {
    event_loop: EventLoop,
    local_addr: SocketAddr,
    fd: RawFd,
    shared: Arc<ListenerShared>,
}

impl Listener {
    /// The address the listener is bound to; useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes the listening socket and fires the
    /// destroy callback once the accept loop has drained. Idempotent.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let event_loop = self.event_loop.clone();
        let fd = self.fd;
        let shared = Arc::clone(&self.shared);
        let task = Task::new("listener-destroy", move |status: TaskStatus| {
            if status == TaskStatus::RunReady {
                let _ = event_loop.unsubscribe(fd);
            }
            if let Some(cb) = shared.on_destroy.lock().unwrap().take() {
                cb();
            }
        });
        if let Err(rejected) = self.event_loop.schedule_internal(task, None) {
            rejected.task.run(TaskStatus::Canceled);
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
