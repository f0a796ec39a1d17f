//! TLS channels end to end: negotiation, backpressure interplay,
//! timeout and hangup handling, and context construction.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sluice::bootstrap::{
    ClientBootstrap, ClientConnectionOptions, ServerBootstrap, ServerListenerOptions,
};
use sluice::channel::SlotHandle;
use sluice::event_loop::{EventLoopGroup, EventLoopGroupOptions};
use sluice::tls::{self, TlsConnectionOptions, TlsContext, TlsContextOptions};
use sluice::Error;

mod util;
use util::{init, wait_for, RwHandler, RwStats, TestCerts, FLUSH_OUTBOX, LONG_TIMEOUT};

const CLIENT_PAYLOAD: &[u8] = b"I'm a big teapot";
const SERVER_PAYLOAD: &[u8] = b"I'm a little teapot.";

fn server_tls(certs: &TestCerts, alpn: &str) -> TlsConnectionOptions {
    let mut options = TlsContextOptions::new()
        .server_from_path(&certs.cert_path, &certs.key_path)
        .with_verify_peer(false);
    if !alpn.is_empty() {
        options = options.with_alpn_list(alpn);
    }
    let context = TlsContext::new_server(&options).expect("server context");
    TlsConnectionOptions::new(&context)
}

fn client_tls(certs: &TestCerts, alpn: &str) -> TlsConnectionOptions {
    let mut options = TlsContextOptions::new()
        .with_trust_store(&certs.ca_path)
        .with_server_name("localhost");
    if !alpn.is_empty() {
        options = options.with_alpn_list(alpn);
    }
    let context = TlsContext::new_client(&options).expect("client context");
    TlsConnectionOptions::new(&context)
}

struct Side {
    stats: Arc<Mutex<Option<Arc<RwStats>>>>,
    slot: Arc<Mutex<Option<SlotHandle>>>,
    outbox: Arc<Mutex<Option<Arc<Mutex<std::collections::VecDeque<Vec<u8>>>>>>>,
}

impl Side {
    fn new() -> Side {
        Side {
            stats: Arc::new(Mutex::new(None)),
            slot: Arc::new(Mutex::new(None)),
            outbox: Arc::new(Mutex::new(None)),
        }
    }

    fn ready(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    fn write(&self, payload: &[u8]) {
        self.outbox
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .lock()
            .unwrap()
            .push_back(payload.to_vec());
        self.slot
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .schedule_task(FLUSH_OUTBOX, None)
            .expect("flush");
    }

    fn received(&self) -> Vec<u8> {
        self.stats
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.received())
            .unwrap_or_default()
    }

    fn read_invocations(&self) -> usize {
        self.stats
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.read_invocations())
            .unwrap_or(0)
    }

    fn increment(&self, size: usize) {
        self.slot
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .increment_read_window(size)
            .expect("increment");
    }
}

#[test]
fn tls_echo_with_backpressure() {
    init();
    let certs = TestCerts::generate("tls-echo");
    let group = EventLoopGroup::new(EventLoopGroupOptions {
        loop_count: 2,
        ..Default::default()
    })
    .expect("group");

    let server = Side::new();
    let server_side = (
        Arc::clone(&server.stats),
        Arc::clone(&server.slot),
        Arc::clone(&server.outbox),
    );
    let listener = ServerBootstrap::new(&group)
        .listen(
            ServerListenerOptions::new("127.0.0.1", 0)
                .enable_read_back_pressure(true)
                .tls(server_tls(&certs, ""))
                .on_incoming(move |result| {
                    let channel = result.expect("incoming");
                    let handler = RwHandler::new(CLIENT_PAYLOAD.len() / 2);
                    *server_side.0.lock().unwrap() = Some(handler.stats());
                    *server_side.2.lock().unwrap() = Some(handler.outbox());
                    let slot = channel
                        .append_handler(Box::new(handler))
                        .expect("append server handler");
                    *server_side.1.lock().unwrap() = Some(slot);
                }),
        )
        .expect("listen");
    let addr = listener.local_addr();

    let client = Side::new();
    let client_side = (
        Arc::clone(&client.stats),
        Arc::clone(&client.slot),
        Arc::clone(&client.outbox),
    );
    let negotiated_alpn = Arc::new(Mutex::new(None));
    let alpn_out = Arc::clone(&negotiated_alpn);
    ClientBootstrap::new(&group).connect(
        ClientConnectionOptions::new("127.0.0.1", addr.port())
            .enable_read_back_pressure(true)
            .tls(client_tls(&certs, ""))
            .on_setup(move |result| {
                let setup = result.expect("client setup");
                *alpn_out.lock().unwrap() = setup.tls.clone();
                let handler = RwHandler::new(SERVER_PAYLOAD.len() / 2);
                *client_side.0.lock().unwrap() = Some(handler.stats());
                *client_side.2.lock().unwrap() = Some(handler.outbox());
                let slot = setup
                    .channel
                    .append_handler(Box::new(handler))
                    .expect("append client handler");
                *client_side.1.lock().unwrap() = Some(slot);
            }),
    );

    wait_for("negotiated channels", LONG_TIMEOUT, || {
        client.ready() && server.ready()
    });
    assert!(negotiated_alpn.lock().unwrap().is_some());

    client.write(CLIENT_PAYLOAD);
    server.write(SERVER_PAYLOAD);

    wait_for("server half window", LONG_TIMEOUT, || {
        server.received().len() == CLIENT_PAYLOAD.len() / 2
    });
    wait_for("client half window", LONG_TIMEOUT, || {
        client.received().len() == SERVER_PAYLOAD.len() / 2
    });
    assert_eq!(server.read_invocations(), 1);
    assert_eq!(client.read_invocations(), 1);

    client.increment(100);
    server.increment(100);
    wait_for("full payloads", LONG_TIMEOUT, || {
        server.received() == CLIENT_PAYLOAD && client.received() == SERVER_PAYLOAD
    });
    assert_eq!(server.read_invocations(), 2);
    assert_eq!(client.read_invocations(), 2);

    let channel = {
        let guard = client.slot.lock().unwrap();
        guard.as_ref().unwrap().channel().clone()
    };
    channel.shutdown(None);
    listener.destroy();
    group.shutdown().expect("group shutdown");
}

#[test]
fn tls_shutdown_flushes_cached_plaintext_first() {
    init();
    let certs = TestCerts::generate("tls-cache");
    let group = EventLoopGroup::new(EventLoopGroupOptions {
        loop_count: 2,
        ..Default::default()
    })
    .expect("group");

    let server = Side::new();
    let server_side = (
        Arc::clone(&server.stats),
        Arc::clone(&server.slot),
        Arc::clone(&server.outbox),
    );
    let listener = ServerBootstrap::new(&group)
        .listen(
            ServerListenerOptions::new("127.0.0.1", 0)
                .enable_read_back_pressure(true)
                .tls(server_tls(&certs, ""))
                .on_incoming(move |result| {
                    let channel = result.expect("incoming");
                    let handler = RwHandler::new(usize::MAX / 2);
                    *server_side.0.lock().unwrap() = Some(handler.stats());
                    *server_side.2.lock().unwrap() = Some(handler.outbox());
                    let slot = channel
                        .append_handler(Box::new(handler))
                        .expect("append server handler");
                    *server_side.1.lock().unwrap() = Some(slot);
                }),
        )
        .expect("listen");
    let addr = listener.local_addr();

    // Client window of 8 against a 20-byte message: 12 bytes will sit
    // decrypted in the TLS handler when shutdown begins. The read hook
    // initiates shutdown from the first read callback and then opens
    // the window; every byte must still arrive.
    let client = Side::new();
    let client_side = (
        Arc::clone(&client.stats),
        Arc::clone(&client.slot),
        Arc::clone(&client.outbox),
    );
    let client_shutdown: Arc<Mutex<Option<sluice::Result<()>>>> = Arc::new(Mutex::new(None));
    let csh = Arc::clone(&client_shutdown);
    ClientBootstrap::new(&group).connect(
        ClientConnectionOptions::new("127.0.0.1", addr.port())
            .enable_read_back_pressure(true)
            .tls(client_tls(&certs, ""))
            .on_setup(move |result| {
                let setup = result.expect("client setup");
                let handler = RwHandler::new(8).with_read_hook(|slot, invocation| {
                    if invocation == 1 {
                        slot.channel().expect("channel").shutdown(None);
                        slot.increment_read_window(100).expect("increment");
                    }
                });
                *client_side.0.lock().unwrap() = Some(handler.stats());
                *client_side.2.lock().unwrap() = Some(handler.outbox());
                let slot = setup
                    .channel
                    .append_handler(Box::new(handler))
                    .expect("append client handler");
                *client_side.1.lock().unwrap() = Some(slot);
            })
            .on_shutdown(move |_, result| {
                *csh.lock().unwrap() = Some(result);
            }),
    );

    wait_for("negotiated channels", LONG_TIMEOUT, || {
        client.ready() && server.ready()
    });
    server.write(SERVER_PAYLOAD);

    wait_for("clean shutdown with all bytes", LONG_TIMEOUT, || {
        client_shutdown.lock().unwrap().is_some()
    });
    assert!(client_shutdown.lock().unwrap().as_ref().unwrap().is_ok());
    assert_eq!(client.received(), SERVER_PAYLOAD);
    assert_eq!(client.read_invocations(), 2);

    listener.destroy();
    group.shutdown().expect("group shutdown");
}

#[test]
fn tls_negotiation_timeout_fires_within_bounds() {
    init();
    let group = EventLoopGroup::new(EventLoopGroupOptions {
        loop_count: 1,
        ..Default::default()
    })
    .expect("group");

    // A TCP server that accepts and never answers the hello.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let silent = thread::spawn(move || {
        let conn = listener.accept().ok();
        let _ = stop_rx.recv_timeout(Duration::from_secs(30));
        drop(conn);
    });

    let options = TlsContextOptions::new()
        .with_verify_peer(false)
        .with_server_name("localhost")
        .with_timeout_ms(1000);
    let context = TlsContext::new_client(&options).expect("context");

    let setup_err: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let shutdown_fired = Arc::new(AtomicUsize::new(0));
    let se = Arc::clone(&setup_err);
    let sf = Arc::clone(&shutdown_fired);
    let start = Instant::now();
    ClientBootstrap::new(&group).connect(
        ClientConnectionOptions::new("127.0.0.1", addr.port())
            .tls(TlsConnectionOptions::new(&context))
            .on_setup(move |result| {
                *se.lock().unwrap() = Some(result.expect_err("must time out"));
            })
            .on_shutdown(move |_, _| {
                sf.fetch_add(1, Ordering::SeqCst);
            }),
    );

    wait_for("negotiation timeout", LONG_TIMEOUT, || {
        setup_err.lock().unwrap().is_some()
    });
    let elapsed = start.elapsed();
    assert_eq!(
        setup_err.lock().unwrap().as_ref().unwrap().code(),
        Error::TlsNegotiationTimeout.code()
    );
    assert!(setup_err.lock().unwrap().as_ref().unwrap().is_tls());
    assert!(elapsed >= Duration::from_millis(900), "too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2500), "too late: {:?}", elapsed);
    // Setup failed, so no shutdown callback.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(shutdown_fired.load(Ordering::SeqCst), 0);

    let _ = stop_tx.send(());
    silent.join().unwrap();
    group.shutdown().expect("group shutdown");
}

#[test]
fn tls_socket_closed_mid_negotiation() {
    init();
    let group = EventLoopGroup::new(EventLoopGroupOptions {
        loop_count: 1,
        ..Default::default()
    })
    .expect("group");

    // Accept and hang up immediately; the client's hello meets a dead
    // socket.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().unwrap();
    let hangup = thread::spawn(move || {
        let _ = listener.accept();
        // Connection drops here.
    });

    let options = TlsContextOptions::new()
        .with_verify_peer(false)
        .with_server_name("localhost")
        .with_timeout_ms(0);
    let context = TlsContext::new_client(&options).expect("context");

    let setup_err: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let se = Arc::clone(&setup_err);
    ClientBootstrap::new(&group).connect(
        ClientConnectionOptions::new("127.0.0.1", addr.port())
            .tls(TlsConnectionOptions::new(&context))
            .on_setup(move |result| {
                *se.lock().unwrap() = Some(result.expect_err("must fail"));
            }),
    );

    wait_for("socket closed error", LONG_TIMEOUT, || {
        setup_err.lock().unwrap().is_some()
    });
    let guard = setup_err.lock().unwrap();
    let err = guard.as_ref().unwrap();
    assert_eq!(err.code(), Error::SocketClosed.code());
    assert!(!err.is_tls());
    drop(guard);

    hangup.join().unwrap();
    group.shutdown().expect("group shutdown");
}

#[test]
fn tls_server_survives_raw_client_hangup_and_listener_destroys() {
    init();
    let certs = TestCerts::generate("tls-hangup");
    let group = EventLoopGroup::new(EventLoopGroupOptions {
        loop_count: 1,
        ..Default::default()
    })
    .expect("group");

    let incoming_err: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let destroyed = Arc::new(AtomicUsize::new(0));
    let ie = Arc::clone(&incoming_err);
    let de = Arc::clone(&destroyed);
    let listener = ServerBootstrap::new(&group)
        .listen(
            ServerListenerOptions::new("127.0.0.1", 0)
                .tls(server_tls(&certs, ""))
                .on_incoming(move |result| {
                    *ie.lock().unwrap() = Some(result.expect_err("handshake cannot finish"));
                })
                .on_destroy(move || {
                    de.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .expect("listen");
    let addr = listener.local_addr();

    // Raw TCP client: connect, say nothing, hang up after a second.
    let mut raw = std::net::TcpStream::connect(addr).expect("connect");
    raw.write_all(b"\x16\x03\x01").ok();
    thread::sleep(Duration::from_secs(1));
    drop(raw);

    wait_for("server-side negotiation failure", LONG_TIMEOUT, || {
        incoming_err.lock().unwrap().is_some()
    });
    assert_eq!(
        incoming_err.lock().unwrap().as_ref().unwrap().code(),
        Error::SocketClosed.code()
    );

    listener.destroy();
    wait_for("destroy callback", LONG_TIMEOUT, || {
        destroyed.load(Ordering::SeqCst) == 1
    });
    group.shutdown().expect("group shutdown");
}

#[test]
fn concurrent_context_construction_is_safe() {
    init();
    let threads: Vec<_> = (0..2)
        .map(|i| {
            thread::spawn(move || {
                let certs = TestCerts::generate(&format!("concurrent-{}", i));
                let server = TlsContext::new_server(
                    &TlsContextOptions::new()
                        .server_from_path(&certs.cert_path, &certs.key_path)
                        .with_verify_peer(false),
                )
                .expect("server context");
                let client = TlsContext::new_client(
                    &TlsContextOptions::new()
                        .with_trust_store(&certs.ca_path)
                        .with_server_name("localhost"),
                )
                .expect("client context");
                assert!(client.alpn_is_available());
                (server, client)
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("context build");
    }
}

#[test]
fn alpn_result_is_surfaced() {
    init();
    assert!(tls::alpn_is_available());

    let certs = TestCerts::generate("alpn");
    let group = EventLoopGroup::new(EventLoopGroupOptions {
        loop_count: 1,
        ..Default::default()
    })
    .expect("group");

    let listener = ServerBootstrap::new(&group)
        .listen(
            ServerListenerOptions::new("127.0.0.1", 0)
                .tls(server_tls(&certs, "h2"))
                .on_incoming(|result| {
                    result.expect("incoming");
                }),
        )
        .expect("listen");
    let addr = listener.local_addr();

    let negotiated: Arc<Mutex<Option<Option<String>>>> = Arc::new(Mutex::new(None));
    let neg = Arc::clone(&negotiated);
    ClientBootstrap::new(&group).connect(
        ClientConnectionOptions::new("127.0.0.1", addr.port())
            .tls(client_tls(&certs, "h2;http/1.1"))
            .on_setup(move |result| {
                let setup = result.expect("setup");
                *neg.lock().unwrap() = Some(setup.tls.and_then(|tls| tls.alpn));
                setup.channel.shutdown(None);
            }),
    );

    wait_for("alpn outcome", LONG_TIMEOUT, || {
        negotiated.lock().unwrap().is_some()
    });
    assert_eq!(
        negotiated.lock().unwrap().as_ref().unwrap().as_deref(),
        Some("h2")
    );

    listener.destroy();
    group.shutdown().expect("group shutdown");
}
