// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use sluice::channel::{ChannelHandler, Direction, Message, Slot};
use sluice::{Error, Result, TaskStatus};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

/// Spin-waits (with a sleep) until `condition` holds or `timeout`
/// elapses. Panics with `what` on timeout.
pub fn wait_for(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub const LONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Observable state shared between a [`RwHandler`] on a loop thread and
/// the test thread.
#[derive(Default)]
pub struct RwStats {
    pub received: Mutex<Vec<u8>>,
    pub read_invocations: AtomicUsize,
    pub writes_completed: AtomicUsize,
    pub shutdown_read: AtomicBool,
    pub shutdown_write: AtomicBool,
}

impl RwStats {
    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    pub fn read_invocations(&self) -> usize {
        self.read_invocations.load(Ordering::SeqCst)
    }
}

type ReadHook = Box<dyn Fn(&Slot, usize) + Send>;

/// User-end pipeline handler for tests: records everything it reads,
/// writes whatever the test queues into its outbox, and optionally runs
/// a hook on each read delivery.
pub struct RwHandler {
    stats: Arc<RwStats>,
    outbox: Arc<Mutex<VecDeque<Vec<u8>>>>,
    initial_window: usize,
    read_hook: Option<ReadHook>,
}

/// Task tag asking a [`RwHandler`] to flush its outbox onto the wire.
pub const FLUSH_OUTBOX: &str = "test-flush-outbox";

impl RwHandler {
    pub fn new(initial_window: usize) -> RwHandler {
        RwHandler {
            stats: Arc::new(RwStats::default()),
            outbox: Arc::new(Mutex::new(VecDeque::new())),
            initial_window,
            read_hook: None,
        }
    }

    /// Runs `hook(slot, invocation_number)` after each read is
    /// recorded.
    pub fn with_read_hook(mut self, hook: impl Fn(&Slot, usize) + Send + 'static) -> RwHandler {
        self.read_hook = Some(Box::new(hook));
        self
    }

    pub fn stats(&self) -> Arc<RwStats> {
        Arc::clone(&self.stats)
    }

    pub fn outbox(&self) -> Arc<Mutex<VecDeque<Vec<u8>>>> {
        Arc::clone(&self.outbox)
    }
}

impl ChannelHandler for RwHandler {
    fn process_read_message(&mut self, slot: &Slot, message: Message) -> Result<()> {
        self.stats
            .received
            .lock()
            .unwrap()
            .extend_from_slice(&message.data);
        let invocation = self.stats.read_invocations.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.read_hook {
            hook(slot, invocation);
        }
        Ok(())
    }

    fn process_write_message(&mut self, _slot: &Slot, message: Message) -> Result<()> {
        // Topmost slot; writes originate here and never arrive here.
        message.complete(Err(Error::ChannelShutdown));
        Ok(())
    }

    fn increment_read_window(&mut self, _slot: &Slot, _size: usize) {}

    fn shutdown(
        &mut self,
        slot: &Slot,
        direction: Direction,
        _error: Option<Error>,
        _free_scarce_resources: bool,
    ) {
        match direction {
            Direction::Read => self.stats.shutdown_read.store(true, Ordering::SeqCst),
            Direction::Write => self.stats.shutdown_write.store(true, Ordering::SeqCst),
        }
        slot.on_shutdown_complete(direction, None);
    }

    fn initial_window_size(&self) -> usize {
        self.initial_window
    }

    fn on_task(&mut self, slot: &Slot, tag: &'static str, status: TaskStatus) {
        if tag != FLUSH_OUTBOX || status != TaskStatus::RunReady {
            return;
        }
        let pending: Vec<Vec<u8>> = self.outbox.lock().unwrap().drain(..).collect();
        for bytes in pending {
            let stats = Arc::clone(&self.stats);
            let message = Message::application_data(&bytes[..]).with_completion(move |result| {
                if result.is_ok() {
                    stats.writes_completed.fetch_add(1, Ordering::SeqCst);
                }
            });
            if let Err(rejected) = slot.send_write(message) {
                panic!("test write rejected: {}", rejected.error);
            }
        }
    }
}

/// A CA plus a leaf certificate for `localhost`, written as PEM files
/// under a fresh temp directory.
pub struct TestCerts {
    pub dir: PathBuf,
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TestCerts {
    pub fn generate(tag: &str) -> TestCerts {
        use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

        let ca_key = KeyPair::generate().expect("generate CA key");
        let mut ca_params = CertificateParams::new(Vec::new()).expect("CA params");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign CA");

        let leaf_key = KeyPair::generate().expect("generate leaf key");
        let leaf_params =
            CertificateParams::new(vec!["localhost".to_string()]).expect("leaf params");
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .expect("sign leaf");

        static UNIQUE: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "sluice-test-{}-{}-{}",
            tag,
            std::process::id(),
            UNIQUE.fetch_add(1, Ordering::SeqCst),
        ));
        fs::create_dir_all(&dir).expect("create cert dir");
        let ca_path = dir.join("ca.pem");
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        fs::write(&ca_path, ca_cert.pem()).expect("write CA");
        fs::write(&cert_path, leaf_cert.pem()).expect("write cert");
        fs::write(&key_path, leaf_key.serialize_pem()).expect("write key");

        TestCerts {
            dir,
            ca_path,
            cert_path,
            key_path,
        }
    }
}

impl Drop for TestCerts {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}
