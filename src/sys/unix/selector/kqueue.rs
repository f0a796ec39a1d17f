use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{cmp, io, ptr};

use crate::interest::{Interest, Readiness};

// Type of the `nchanges`/`nevents` parameters of `kevent(2)`.
#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

// Type of the `filter` field of `struct kevent`.
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "openbsd"
))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `flags` field of `struct kevent`.
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "openbsd"
))]
type Flags = libc::c_ushort;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Flags = u16;
#[cfg(target_os = "netbsd")]
type Flags = u32;

// Type of the `udata` field of `struct kevent`.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $token: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags as Flags,
            fflags: 0,
            data: 0,
            udata: $token as UData,
        }
    };
}

/// Readiness selector backed by `kqueue(2)`.
///
/// Filters are registered with `EV_CLEAR`, matching the edge-triggered
/// discipline of the epoll backend.
#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        // SAFETY: `kqueue(2)` returned a fresh, valid fd.
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timespec = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            // Less than a billion, so the casts are lossless.
            tv_nsec: to.subsec_nanos() as _,
        });
        let timespec = timespec
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        events.clear();
        syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            events.as_mut_ptr(),
            events.capacity() as Count,
            timespec,
        ))
        .map(|n_events| {
            // SAFETY: `kevent` initialized `n_events` entries.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let flags = libc::EV_ADD | libc::EV_CLEAR;
        let mut changes: [libc::kevent; 2] = [kevent!(0, 0, 0, 0), kevent!(0, 0, 0, 0)];
        let mut n_changes: usize = 0;

        if interest.is_readable() {
            changes[n_changes] = kevent!(fd, libc::EVFILT_READ, flags, token);
            n_changes += 1;
        }
        if interest.is_writable() {
            changes[n_changes] = kevent!(fd, libc::EVFILT_WRITE, flags, token);
            n_changes += 1;
        }

        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            n_changes as Count,
            ptr::null_mut(),
            0,
            ptr::null(),
        ))
        .map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // Delete both filters; a filter that was never added reports
        // ENOENT, which the per-change loop below treats as success.
        let changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_READ, libc::EV_DELETE, 0),
            kevent!(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0),
        ];

        let mut result = Ok(());
        for change in changes.iter() {
            let res = syscall!(kevent(
                self.kq.as_raw_fd(),
                change,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            ));
            match res {
                Ok(_) => {}
                Err(ref err) if err.raw_os_error() == Some(libc::ENOENT) => {}
                Err(err) => result = Err(err),
            }
        }
        result
    }
}

pub(crate) type Event = libc::kevent;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::*;

    pub(crate) fn token(event: &Event) -> usize {
        event.udata as usize
    }

    pub(crate) fn readiness(event: &Event) -> Readiness {
        let mut readiness = Readiness::EMPTY;
        if event.filter == libc::EVFILT_READ as Filter {
            readiness |= Readiness::READABLE;
            if event.flags as libc::c_int & libc::EV_EOF as libc::c_int != 0 {
                readiness |= Readiness::READ_CLOSED;
            }
        }
        if event.filter == libc::EVFILT_WRITE as Filter {
            readiness |= Readiness::WRITABLE;
            if event.flags as libc::c_int & libc::EV_EOF as libc::c_int != 0 {
                readiness |= Readiness::WRITE_CLOSED;
            }
        }
        if event.flags as libc::c_int & libc::EV_ERROR as libc::c_int != 0 {
            readiness |= Readiness::ERROR;
        }
        readiness
    }
}
