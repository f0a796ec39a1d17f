//! Cross-thread wakeup primitive.
//!
//! A `Waker` is the "signal the loop" capability: senders arm it from any
//! thread and the next poll on the owning selector observes it. One waker
//! is registered per event loop, under the loop's reserved token.

#[cfg(any(target_os = "linux", target_os = "android", target_os = "illumos"))]
mod eventfd;
#[cfg(any(target_os = "linux", target_os = "android", target_os = "illumos"))]
use self::eventfd::WakerInternal;

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "illumos")))]
mod pipe;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "illumos")))]
use self::pipe::WakerInternal;

use std::io;
use std::os::fd::{AsRawFd, RawFd};

#[derive(Debug)]
pub(crate) struct Waker {
    inner: WakerInternal,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        WakerInternal::new().map(|inner| Waker { inner })
    }

    /// Arms the waker. May be called from any thread.
    pub(crate) fn wake(&self) -> io::Result<()> {
        self.inner.wake()
    }

    /// Clears the pending wakeup. Called by the loop after observing a
    /// readiness event on the waker's fd.
    pub(crate) fn ack(&self) {
        self.inner.ack();
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
