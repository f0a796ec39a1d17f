use std::fmt;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::{Channel, ChannelOptions, SocketHandler};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, EventLoopGroup};
use crate::interest::{Interest, Readiness};
use crate::net::{SocketOptions, TcpSock};
use crate::resolver::{HostResolver, ThreadedResolver};
use crate::task::{Task, TaskId, TaskStatus};
use crate::tls::{NegotiatedTls, TlsConnectionOptions, TlsHandler};

/// A successfully set-up client channel.
#[derive(Debug)]
pub struct ClientSetup {
    /// The ready channel: socket handler, optional TLS handler, and any
    /// handlers appended from the callbacks.
    pub channel: Channel,
    /// TLS negotiation outcome when TLS options were supplied.
    pub tls: Option<NegotiatedTls>,
}

type CreationCallback = Box<dyn FnOnce(&Channel) + Send>;
type SetupCallback = Box<dyn FnOnce(Result<ClientSetup>) + Send>;
type ShutdownCallback = Box<dyn FnOnce(Channel, Result<()>) + Send>;

/// Options for [`ClientBootstrap::connect`].
pub struct ClientConnectionOptions {
    host: String,
    port: u16,
    socket_options: SocketOptions,
    tls: Option<TlsConnectionOptions>,
    enable_read_back_pressure: bool,
    on_creation: Option<CreationCallback>,
    on_setup: Option<SetupCallback>,
    on_shutdown: Option<ShutdownCallback>,
}

impl ClientConnectionOptions {
    /// Options targeting `host:port` with default socket options, no
    /// TLS and read backpressure off.
    pub fn new(host: impl Into<String>, port: u16) -> ClientConnectionOptions {
        ClientConnectionOptions {
            host: host.into(),
            port,
            socket_options: SocketOptions::default(),
            tls: None,
            enable_read_back_pressure: false,
            on_creation: None,
            on_setup: None,
            on_shutdown: None,
        }
    }

    /// Socket options applied to the connecting socket.
    pub fn socket_options(mut self, options: SocketOptions) -> ClientConnectionOptions {
        self.socket_options = options;
        self
    }

    /// Layers TLS onto the channel. The connection's server name
    /// defaults to the target host when the options carry none.
    pub fn tls(mut self, options: TlsConnectionOptions) -> ClientConnectionOptions {
        self.tls = Some(options);
        self
    }

    /// Enables per-slot read windows on the new channel.
    pub fn enable_read_back_pressure(mut self, enable: bool) -> ClientConnectionOptions {
        self.enable_read_back_pressure = enable;
        self
    }

    /// Fired on the loop thread right after the channel exists, before
    /// the socket handler is installed. This is the spot to attach a
    /// statistics observer.
    pub fn on_creation<F>(mut self, f: F) -> ClientConnectionOptions
    where
        F: FnOnce(&Channel) + Send + 'static,
    {
        self.on_creation = Some(Box::new(f));
        self
    }

    /// Fired exactly once on the loop thread: with the ready channel
    /// after negotiation (if any) succeeds, or with the error if any
    /// step of connection setup fails. On error no channel exists and no
    /// shutdown callback will follow.
    pub fn on_setup<F>(mut self, f: F) -> ClientConnectionOptions
    where
        F: FnOnce(Result<ClientSetup>) + Send + 'static,
    {
        self.on_setup = Some(Box::new(f));
        self
    }

    /// Fired at most once, after a successfully set-up channel finishes
    /// shutdown.
    pub fn on_shutdown<F>(mut self, f: F) -> ClientConnectionOptions
    where
        F: FnOnce(Channel, Result<()>) + Send + 'static,
    {
        self.on_shutdown = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for ClientConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnectionOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Orchestrates client connections: resolve, connect on a group loop,
/// compose the channel, negotiate TLS, hand the result to callbacks.
///
/// Bootstraps are stateless across connections; one bootstrap can set
/// up any number of channels, sequentially or concurrently.
#[derive(Clone)]
pub struct ClientBootstrap {
    inner: Arc<ClientBootstrapInner>,
}

struct ClientBootstrapInner {
    group: EventLoopGroup,
    resolver: Arc<dyn HostResolver>,
}

impl ClientBootstrap {
    /// A bootstrap over `group` with the threaded system resolver.
    pub fn new(group: &EventLoopGroup) -> ClientBootstrap {
        ClientBootstrap::with_resolver(group, ThreadedResolver::new())
    }

    /// A bootstrap with a custom resolver.
    pub fn with_resolver(group: &EventLoopGroup, resolver: Arc<dyn HostResolver>) -> ClientBootstrap {
        ClientBootstrap {
            inner: Arc::new(ClientBootstrapInner {
                group: group.clone(),
                resolver,
            }),
        }
    }

    /// Begins an asynchronous connection. Progress and failure are
    /// reported exclusively through the options' callbacks.
    pub fn connect(&self, options: ClientConnectionOptions) {
        let ClientConnectionOptions {
            host,
            port,
            socket_options,
            tls,
            enable_read_back_pressure,
            on_creation,
            on_setup,
            on_shutdown,
        } = options;
        let on_setup = on_setup.unwrap_or_else(|| Box::new(|_| {}));
        let event_loop = self.inner.group.next_loop();

        let resolve_loop = event_loop.clone();
        let resolve_host = host.clone();
        self.inner.resolver.resolve(
            &host,
            Box::new(move |result| match result {
                Err(err) => {
                    deliver_setup_failure(&resolve_loop, on_setup, err);
                }
                Ok(addrs) => {
                    let attempt = Arc::new(Mutex::new(Attempt {
                        event_loop: resolve_loop.clone(),
                        host: resolve_host,
                        port,
                        addrs,
                        next_addr: 0,
                        last_error: None,
                        socket_options,
                        tls,
                        enable_read_back_pressure,
                        on_creation,
                        on_setup: Some(on_setup),
                        on_shutdown,
                        sock: None,
                        timeout_task: None,
                        done: false,
                    }));
                    let task = Task::new("client-connect-attempt", move |status: TaskStatus| {
                        if status == TaskStatus::Canceled {
                            let mut attempt = attempt.lock().unwrap();
                            if let Some(cb) = attempt.on_setup.take() {
                                cb(Err(Error::EventLoopShutdown));
                            }
                            return;
                        }
                        start_attempt(&attempt);
                    });
                    if let Err(rejected) = resolve_loop.schedule_internal(task, None) {
                        rejected.task.run(TaskStatus::Canceled);
                    }
                }
            }),
        );
    }
}

impl fmt::Debug for ClientBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBootstrap")
            .field("group", &self.inner.group)
            .finish()
    }
}

fn deliver_setup_failure(event_loop: &EventLoop, on_setup: SetupCallback, err: Error) {
    let task = Task::new("client-setup-failed", move |_| on_setup(Err(err)));
    if let Err(rejected) = event_loop.schedule_internal(task, None) {
        // No loop to deliver on; the callback still fires, here.
        rejected.task.run(TaskStatus::Canceled);
    }
}

struct Attempt {
    event_loop: EventLoop,
    host: String,
    port: u16,
    addrs: Vec<std::net::IpAddr>,
    next_addr: usize,
    last_error: Option<Error>,
    socket_options: SocketOptions,
    tls: Option<TlsConnectionOptions>,
    enable_read_back_pressure: bool,
    on_creation: Option<CreationCallback>,
    on_setup: Option<SetupCallback>,
    on_shutdown: Option<ShutdownCallback>,
    sock: Option<TcpSock>,
    timeout_task: Option<TaskId>,
    done: bool,
}

type SharedAttempt = Arc<Mutex<Attempt>>;

/// Tries addresses in resolver order until a non-blocking connect can
/// be started. Runs on the chosen loop's thread.
fn start_attempt(attempt: &SharedAttempt) {
    loop {
        let (addr, socket_options, event_loop, timeout) = {
            let mut state = attempt.lock().unwrap();
            if state.next_addr >= state.addrs.len() {
                let err = state.last_error.take().unwrap_or(Error::SocketClosed);
                state.done = true;
                if let Some(cb) = state.on_setup.take() {
                    cb(Err(err));
                }
                return;
            }
            let addr = SocketAddr::new(state.addrs[state.next_addr], state.port);
            state.next_addr += 1;
            (
                addr,
                state.socket_options.clone(),
                state.event_loop.clone(),
                state.socket_options.connect_timeout,
            )
        };

        let sock = match TcpSock::connect(addr, &socket_options) {
            Ok(sock) => sock,
            Err(err) => {
                attempt.lock().unwrap().last_error =
                    Some(Error::SocketConnectFailure(Arc::new(err)));
                continue;
            }
        };
        let fd = sock.as_raw_fd();
        attempt.lock().unwrap().sock = Some(sock);

        let sub_attempt = Arc::clone(attempt);
        let subscribed = event_loop.subscribe(fd, Interest::WRITABLE, move |el, readiness| {
            on_connect_event(&sub_attempt, el, readiness);
        });
        if let Err(err) = subscribed {
            let mut state = attempt.lock().unwrap();
            state.sock = None;
            state.last_error = Some(err);
            continue;
        }

        if let Some(timeout) = timeout {
            let timer_attempt = Arc::clone(attempt);
            let task = Task::new("socket-connect-timeout", move |status: TaskStatus| {
                if status == TaskStatus::RunReady {
                    on_connect_timeout(&timer_attempt);
                }
            });
            match event_loop.schedule_local(task, Some(timeout)) {
                Ok(id) => attempt.lock().unwrap().timeout_task = Some(id),
                Err(err) => trace!("connect timeout not armed: {}", err),
            }
        }
        return;
    }
}

fn on_connect_event(attempt: &SharedAttempt, event_loop: &EventLoop, readiness: Readiness) {
    let outcome = {
        let state = attempt.lock().unwrap();
        if state.done {
            return;
        }
        let Some(sock) = state.sock.as_ref() else { return };
        match sock.take_error() {
            Ok(Some(err)) => Some(err),
            Err(err) => Some(err),
            Ok(None) => {
                if readiness.is_writable() {
                    None
                } else if readiness.is_error() || readiness.is_write_closed() {
                    Some(std::io::Error::other("connect failed"))
                } else {
                    return;
                }
            }
        }
    };

    // Either way this attempt's socket is resolved; tear its
    // subscription and timer down before moving on.
    let sock = {
        let mut state = attempt.lock().unwrap();
        if let Some(id) = state.timeout_task.take() {
            let _ = event_loop.cancel_task(id);
        }
        let sock = state.sock.take();
        if let Some(sock) = sock.as_ref() {
            let _ = event_loop.unsubscribe(sock.as_raw_fd());
        }
        sock
    };
    let Some(sock) = sock else { return };

    match outcome {
        Some(err) => {
            trace!("connect attempt failed: {}", err);
            attempt.lock().unwrap().last_error =
                Some(Error::SocketConnectFailure(Arc::new(err)));
            drop(sock);
            start_attempt(attempt);
        }
        None => {
            let mut state = attempt.lock().unwrap();
            state.done = true;
            let host = state.host.clone();
            let enable_bp = state.enable_read_back_pressure;
            let tls = state.tls.take();
            let on_creation = state.on_creation.take();
            let on_setup = state.on_setup.take();
            let on_shutdown = state.on_shutdown.take();
            drop(state);
            build_channel(
                event_loop, sock, host, tls, enable_bp, on_creation, on_setup, on_shutdown,
            );
        }
    }
}

fn on_connect_timeout(attempt: &SharedAttempt) {
    let mut state = attempt.lock().unwrap();
    if state.done {
        return;
    }
    state.done = true;
    state.timeout_task = None;
    if let Some(sock) = state.sock.take() {
        let _ = state.event_loop.unsubscribe(sock.as_raw_fd());
    }
    if let Some(cb) = state.on_setup.take() {
        cb(Err(Error::SocketTimeout));
    }
}

/// Connected socket in hand: compose the channel. The channel-level
/// setup callback runs on this same loop and installs the handlers; the
/// bootstrap's own setup callback fires once negotiation (if any)
/// succeeds.
#[allow(clippy::too_many_arguments)]
fn build_channel(
    event_loop: &EventLoop,
    sock: TcpSock,
    host: String,
    tls: Option<TlsConnectionOptions>,
    enable_read_back_pressure: bool,
    on_creation: Option<CreationCallback>,
    on_setup: Option<SetupCallback>,
    on_shutdown: Option<ShutdownCallback>,
) {
    let on_setup = on_setup.unwrap_or_else(|| Box::new(|_| {}));
    let setup_succeeded = Arc::new(AtomicBool::new(false));

    let setup_flag = Arc::clone(&setup_succeeded);
    let options = ChannelOptions::new()
        .enable_read_back_pressure(enable_read_back_pressure)
        .on_setup_completed(move |result| {
            let channel = match result {
                Ok(channel) => channel,
                Err(err) => {
                    on_setup(Err(err));
                    return;
                }
            };
            if let Some(cb) = on_creation {
                cb(&channel);
            }
            if let Err(err) = SocketHandler::install(&channel, sock) {
                on_setup(Err(err.clone()));
                channel.force_shutdown(Some(err));
                return;
            }
            match tls {
                None => {
                    setup_flag.store(true, Ordering::Release);
                    on_setup(Ok(ClientSetup {
                        channel: channel.clone(),
                        tls: None,
                    }));
                }
                Some(tls_options) => {
                    let tls_options = if tls_options.server_name().is_none() {
                        tls_options.with_server_name(host)
                    } else {
                        tls_options
                    };
                    let negotiated_channel = channel.clone();
                    let negotiated_flag = Arc::clone(&setup_flag);
                    let installed =
                        TlsHandler::install_client(&channel, &tls_options, move |result| {
                            match result {
                                Ok(negotiated) => {
                                    negotiated_flag.store(true, Ordering::Release);
                                    on_setup(Ok(ClientSetup {
                                        channel: negotiated_channel.clone(),
                                        tls: Some(negotiated),
                                    }));
                                }
                                Err(err) => on_setup(Err(err)),
                            }
                        });
                    if let Err(err) = installed {
                        // The negotiation callback (and with it the
                        // setup callback) already fired from the
                        // handler's teardown.
                        channel.force_shutdown(Some(err));
                    }
                }
            }
        })
        .on_shutdown_completed(move |channel, result| {
            if setup_succeeded.load(Ordering::Acquire) {
                if let Some(cb) = on_shutdown {
                    cb(channel, result);
                }
            }
        });
    Channel::new(event_loop, options);
}
