//! End-to-end plain-TCP channels through the client and server
//! bootstraps: backpressured delivery, statistics, and bootstrap reuse.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sluice::bootstrap::{
    ClientBootstrap, ClientConnectionOptions, ServerBootstrap, ServerListenerOptions,
};
use sluice::channel::{Channel, ChannelStatistics, SlotHandle};
use sluice::event_loop::{EventLoopGroup, EventLoopGroupOptions};
use sluice::Error;

mod util;
use util::{init, wait_for, RwHandler, RwStats, FLUSH_OUTBOX, LONG_TIMEOUT};

const CLIENT_PAYLOAD: &[u8] = b"I'm a big teapot";
const SERVER_PAYLOAD: &[u8] = b"I'm a little teapot.";

type SharedOutbox = Arc<Mutex<Option<Arc<Mutex<std::collections::VecDeque<Vec<u8>>>>>>>;

#[test]
fn echo_with_backpressure_delivers_everything() {
    init();
    let group = EventLoopGroup::new(EventLoopGroupOptions {
        loop_count: 2,
        ..Default::default()
    })
    .expect("group");

    // Server: window is half the client payload.
    let server_stats: Arc<Mutex<Option<Arc<RwStats>>>> = Arc::new(Mutex::new(None));
    let server_slot: Arc<Mutex<Option<SlotHandle>>> = Arc::new(Mutex::new(None));
    let server_outbox: SharedOutbox = Arc::new(Mutex::new(None));
    let server_channel: Arc<Mutex<Option<Channel>>> = Arc::new(Mutex::new(None));

    let ss = Arc::clone(&server_stats);
    let sl = Arc::clone(&server_slot);
    let so = Arc::clone(&server_outbox);
    let sc = Arc::clone(&server_channel);
    let listener = ServerBootstrap::new(&group)
        .listen(
            ServerListenerOptions::new("127.0.0.1", 0)
                .enable_read_back_pressure(true)
                .on_incoming(move |result| {
                    let channel = result.expect("incoming");
                    let handler = RwHandler::new(CLIENT_PAYLOAD.len() / 2);
                    *ss.lock().unwrap() = Some(handler.stats());
                    *so.lock().unwrap() = Some(handler.outbox());
                    let slot = channel
                        .append_handler(Box::new(handler))
                        .expect("append server handler");
                    *sl.lock().unwrap() = Some(slot);
                    *sc.lock().unwrap() = Some(channel.clone());
                }),
        )
        .expect("listen");
    let addr = listener.local_addr();

    // Client: window is half the server payload.
    let client_stats: Arc<Mutex<Option<Arc<RwStats>>>> = Arc::new(Mutex::new(None));
    let client_slot: Arc<Mutex<Option<SlotHandle>>> = Arc::new(Mutex::new(None));
    let client_outbox: SharedOutbox = Arc::new(Mutex::new(None));
    let client_shutdown: Arc<Mutex<Option<sluice::Result<()>>>> = Arc::new(Mutex::new(None));

    let cs = Arc::clone(&client_stats);
    let cl = Arc::clone(&client_slot);
    let co = Arc::clone(&client_outbox);
    let csh = Arc::clone(&client_shutdown);
    ClientBootstrap::new(&group).connect(
        ClientConnectionOptions::new(addr.ip().to_string(), addr.port())
            .enable_read_back_pressure(true)
            .on_setup(move |result| {
                let setup = result.expect("client setup");
                let handler = RwHandler::new(SERVER_PAYLOAD.len() / 2);
                *cs.lock().unwrap() = Some(handler.stats());
                *co.lock().unwrap() = Some(handler.outbox());
                let slot = setup
                    .channel
                    .append_handler(Box::new(handler))
                    .expect("append client handler");
                *cl.lock().unwrap() = Some(slot);
            })
            .on_shutdown(move |_, result| {
                *csh.lock().unwrap() = Some(result);
            }),
    );

    wait_for("both user handlers", LONG_TIMEOUT, || {
        client_slot.lock().unwrap().is_some() && server_slot.lock().unwrap().is_some()
    });

    // Both sides write their message.
    let push = |slot: &Arc<Mutex<Option<SlotHandle>>>, outbox: &SharedOutbox, payload: &[u8]| {
        outbox
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .lock()
            .unwrap()
            .push_back(payload.to_vec());
        slot.lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .schedule_task(FLUSH_OUTBOX, None)
            .expect("flush");
    };
    push(&client_slot, &client_outbox, CLIENT_PAYLOAD);
    push(&server_slot, &server_outbox, SERVER_PAYLOAD);

    // One flush each: exactly one read invocation with half the bytes.
    wait_for("server first window", LONG_TIMEOUT, || {
        server_stats
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|s| s.received().len() == CLIENT_PAYLOAD.len() / 2)
    });
    wait_for("client first window", LONG_TIMEOUT, || {
        client_stats
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|s| s.received().len() == SERVER_PAYLOAD.len() / 2)
    });
    assert_eq!(
        server_stats.lock().unwrap().as_ref().unwrap().read_invocations(),
        1
    );
    assert_eq!(
        client_stats.lock().unwrap().as_ref().unwrap().read_invocations(),
        1
    );

    // Open the windows; the rest arrives and matches byte-for-byte.
    client_slot
        .lock()
        .unwrap()
        .as_ref()
        .unwrap()
        .increment_read_window(100)
        .expect("client increment");
    server_slot
        .lock()
        .unwrap()
        .as_ref()
        .unwrap()
        .increment_read_window(100)
        .expect("server increment");

    wait_for("full payloads", LONG_TIMEOUT, || {
        let server_done = server_stats
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|s| s.received() == CLIENT_PAYLOAD);
        let client_done = client_stats
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|s| s.received() == SERVER_PAYLOAD);
        server_done && client_done
    });
    assert_eq!(
        server_stats.lock().unwrap().as_ref().unwrap().read_invocations(),
        2
    );
    assert_eq!(
        client_stats.lock().unwrap().as_ref().unwrap().read_invocations(),
        2
    );

    // Clean client-initiated shutdown.
    let channel = {
        let guard = client_slot.lock().unwrap();
        guard.as_ref().unwrap().channel().clone()
    };
    channel.shutdown(None);
    wait_for("client shutdown callback", LONG_TIMEOUT, || {
        client_shutdown.lock().unwrap().is_some()
    });
    assert!(client_shutdown.lock().unwrap().as_ref().unwrap().is_ok());

    listener.destroy();
    group.shutdown().expect("group shutdown");
}

#[test]
fn connect_failure_reports_setup_error_and_no_shutdown() {
    init();
    let group = EventLoopGroup::new(EventLoopGroupOptions {
        loop_count: 1,
        ..Default::default()
    })
    .expect("group");

    // Bind a port and drop the listener so the port is closed.
    let closed_port = {
        let sock = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        sock.local_addr().unwrap().port()
    };

    let setup_err: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let shutdown_fired = Arc::new(AtomicUsize::new(0));
    let se = Arc::clone(&setup_err);
    let sf = Arc::clone(&shutdown_fired);
    ClientBootstrap::new(&group).connect(
        ClientConnectionOptions::new("127.0.0.1", closed_port)
            .on_setup(move |result| {
                *se.lock().unwrap() = Some(result.expect_err("must fail"));
            })
            .on_shutdown(move |_, _| {
                sf.fetch_add(1, Ordering::SeqCst);
            }),
    );

    wait_for("setup failure", LONG_TIMEOUT, || {
        setup_err.lock().unwrap().is_some()
    });
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(shutdown_fired.load(Ordering::SeqCst), 0);

    group.shutdown().expect("group shutdown");
}

#[test]
fn a_bootstrap_survives_a_connect_and_shutdown_cycle() {
    init();
    let group = EventLoopGroup::new(EventLoopGroupOptions {
        loop_count: 1,
        ..Default::default()
    })
    .expect("group");

    let accepted = Arc::new(AtomicUsize::new(0));
    let acc = Arc::clone(&accepted);
    let listener = ServerBootstrap::new(&group)
        .listen(
            ServerListenerOptions::new("127.0.0.1", 0).on_incoming(move |result| {
                result.expect("incoming");
                acc.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("listen");
    let addr = listener.local_addr();
    let bootstrap = ClientBootstrap::new(&group);

    for round in 1..=2 {
        let channel: Arc<Mutex<Option<Channel>>> = Arc::new(Mutex::new(None));
        let shutdown_seen: Arc<Mutex<Option<sluice::Result<()>>>> = Arc::new(Mutex::new(None));
        let ch = Arc::clone(&channel);
        let sh = Arc::clone(&shutdown_seen);
        bootstrap.connect(
            ClientConnectionOptions::new("127.0.0.1", addr.port())
                .on_setup(move |result| {
                    *ch.lock().unwrap() = Some(result.expect("setup").channel);
                })
                .on_shutdown(move |_, result| {
                    *sh.lock().unwrap() = Some(result);
                }),
        );
        wait_for("setup", LONG_TIMEOUT, || channel.lock().unwrap().is_some());
        wait_for("accept", LONG_TIMEOUT, || {
            accepted.load(Ordering::SeqCst) >= round
        });
        channel.lock().unwrap().as_ref().unwrap().shutdown(None);
        wait_for("shutdown", LONG_TIMEOUT, || {
            shutdown_seen.lock().unwrap().is_some()
        });
        assert!(shutdown_seen.lock().unwrap().as_ref().unwrap().is_ok());
    }

    listener.destroy();
    group.shutdown().expect("group shutdown");
}

#[test]
fn statistics_observer_reports_bytes_both_ways() {
    init();
    let group = EventLoopGroup::new(EventLoopGroupOptions {
        loop_count: 1,
        ..Default::default()
    })
    .expect("group");

    // Sink server: it only needs to receive.
    let listener = ServerBootstrap::new(&group)
        .listen(
            ServerListenerOptions::new("127.0.0.1", 0).on_incoming(move |result| {
                let channel = result.expect("incoming");
                let _ = channel.append_handler(Box::new(RwHandler::new(usize::MAX)));
            }),
        )
        .expect("listen");
    let addr = listener.local_addr();

    let snapshots: Arc<Mutex<Vec<ChannelStatistics>>> = Arc::new(Mutex::new(Vec::new()));
    let client_slot: Arc<Mutex<Option<SlotHandle>>> = Arc::new(Mutex::new(None));
    let client_outbox: SharedOutbox = Arc::new(Mutex::new(None));

    let snaps = Arc::clone(&snapshots);
    let cl = Arc::clone(&client_slot);
    let co = Arc::clone(&client_outbox);
    ClientBootstrap::new(&group).connect(
        ClientConnectionOptions::new("127.0.0.1", addr.port())
            .on_creation(move |channel| {
                let snaps = Arc::clone(&snaps);
                channel
                    .set_statistics_observer(Duration::from_millis(25), move |stats| {
                        snaps.lock().unwrap().push(*stats);
                    })
                    .expect("install observer");
            })
            .on_setup(move |result| {
                let setup = result.expect("setup");
                let handler = RwHandler::new(usize::MAX);
                *co.lock().unwrap() = Some(handler.outbox());
                let slot = setup
                    .channel
                    .append_handler(Box::new(handler))
                    .expect("append");
                *cl.lock().unwrap() = Some(slot);
            }),
    );

    wait_for("client handler", LONG_TIMEOUT, || {
        client_slot.lock().unwrap().is_some()
    });
    client_outbox
        .lock()
        .unwrap()
        .as_ref()
        .unwrap()
        .lock()
        .unwrap()
        .push_back(b"count me".to_vec());
    client_slot
        .lock()
        .unwrap()
        .as_ref()
        .unwrap()
        .schedule_task(FLUSH_OUTBOX, None)
        .expect("flush");

    wait_for("statistics flush with bytes", LONG_TIMEOUT, || {
        snapshots
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.bytes_written >= b"count me".len() as u64)
    });

    let channel = {
        let guard = client_slot.lock().unwrap();
        guard.as_ref().unwrap().channel().clone()
    };
    channel.shutdown(None);
    listener.destroy();
    group.shutdown().expect("group shutdown");
}
