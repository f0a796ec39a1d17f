use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{EPOLLET, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::interest::{Interest, Readiness};

/// Readiness selector backed by `epoll(7)`.
///
/// All registrations are edge-triggered; callers are expected to drain
/// until `WouldBlock` and to remember latched readiness themselves.
#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` returns a fresh, valid fd on success.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        // `as_millis` truncates; round up so a sub-millisecond timeout
        // does not turn into a busy loop, unless it is exactly zero.
        let timeout = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis()
                    .min(libc::c_int::MAX as u128) as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as libc::c_int,
            timeout,
        ))
        .map(|n_events| {
            // SAFETY: `epoll_wait` initialized `n_events` entries.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut()
        ))
        .map(|_| ())
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = EPOLLET;
    if interest.is_readable() {
        kind |= EPOLLIN | EPOLLRDHUP;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::*;

    pub(crate) fn token(event: &Event) -> usize {
        event.u64 as usize
    }

    pub(crate) fn readiness(event: &Event) -> Readiness {
        let bits = event.events as libc::c_int;
        let mut readiness = Readiness::EMPTY;
        if bits & libc::EPOLLIN != 0 {
            readiness |= Readiness::READABLE;
        }
        if bits & libc::EPOLLOUT != 0 {
            readiness |= Readiness::WRITABLE;
        }
        if bits & libc::EPOLLERR != 0 {
            readiness |= Readiness::ERROR;
        }
        // Both halves closed, or the peer sent FIN / shutdown(SHUT_RD).
        if bits & libc::EPOLLHUP != 0 || (bits & libc::EPOLLIN != 0 && bits & libc::EPOLLRDHUP != 0)
        {
            readiness |= Readiness::READ_CLOSED;
        }
        if bits & libc::EPOLLHUP != 0 || (bits & libc::EPOLLOUT != 0 && bits & libc::EPOLLERR != 0)
        {
            readiness |= Readiness::WRITE_CLOSED;
        }
        readiness
    }
}
