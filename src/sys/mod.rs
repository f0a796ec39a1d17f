//! Platform-specific bits, kept behind a small facade: a `Selector` for
//! readiness polling, a `Waker` for cross-thread loop wakeup, and socket
//! option helpers.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use self::unix::{event, socket, Events, Selector, Waker};

#[cfg(not(unix))]
compile_error!("sluice only supports Unix-like targets (epoll or kqueue)");
