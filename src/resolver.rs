//! Host-name resolution seam consumed by the client bootstrap.
//!
//! Resolution is asynchronous with a callback, like everything else the
//! bootstrap composes. The bundled [`ThreadedResolver`] runs the system
//! resolver on a short-lived helper thread; deployments with their own
//! resolution strategy implement [`HostResolver`].

use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use crate::error::{Error, Result};

/// Callback receiving the resolved addresses, in preference order.
pub type ResolveCallback = Box<dyn FnOnce(Result<Vec<IpAddr>>) + Send>;

/// Asynchronous host resolution.
pub trait HostResolver: Send + Sync + 'static {
    /// Resolves `host`, invoking `callback` exactly once from an
    /// unspecified thread.
    fn resolve(&self, host: &str, callback: ResolveCallback);
}

/// Resolver backed by the system's `getaddrinfo` on a helper thread.
///
/// Literal IP addresses short-circuit without spawning.
#[derive(Default)]
pub struct ThreadedResolver;

impl ThreadedResolver {
    /// Returns a new resolver.
    pub fn new() -> Arc<ThreadedResolver> {
        Arc::new(ThreadedResolver)
    }
}

impl HostResolver for ThreadedResolver {
    fn resolve(&self, host: &str, callback: ResolveCallback) {
        if let Ok(addr) = host.parse::<IpAddr>() {
            callback(Ok(vec![addr]));
            return;
        }
        let host = host.to_string();
        let spawned = thread::Builder::new()
            .name("sluice-resolver".to_string())
            .spawn(move || {
                let result = (host.as_str(), 0u16)
                    .to_socket_addrs()
                    .map(|addrs| {
                        let mut ips: Vec<IpAddr> = Vec::new();
                        for addr in addrs {
                            if !ips.contains(&addr.ip()) {
                                ips.push(addr.ip());
                            }
                        }
                        ips
                    })
                    .map_err(|err| Error::DnsQueryFailure(Arc::new(err)));
                let result = match result {
                    Ok(ips) if ips.is_empty() => Err(Error::DnsQueryFailure(Arc::new(
                        std::io::Error::other("no addresses returned"),
                    ))),
                    other => other,
                };
                callback(result);
            });
        if let Err(err) = spawned {
            error!("failed to spawn resolver thread: {}", err);
        }
    }
}

impl fmt::Debug for ThreadedResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ThreadedResolver")
    }
}
