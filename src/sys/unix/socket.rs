//! Raw socket option helpers.
//!
//! Options that `socket2` abstracts differently across versions are set
//! here with plain `setsockopt(2)` calls so behavior stays uniform.

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::time::Duration;

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: T) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const T as *const libc::c_void,
        mem::size_of::<T>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub(crate) fn set_tcp_nodelay(fd: RawFd, nodelay: bool) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, nodelay as libc::c_int)
}

/// Enables SO_KEEPALIVE and, where the platform exposes them, the idle
/// time and probe interval knobs.
pub(crate) fn set_keepalive(
    fd: RawFd,
    idle: Option<Duration>,
    interval: Option<Duration>,
) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1 as libc::c_int)?;

    // OpenBSD only has the on/off switch.
    #[cfg(target_os = "openbsd")]
    let _ = (idle, interval);

    #[cfg(not(target_os = "openbsd"))]
    {
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        const IDLE_OPT: libc::c_int = libc::TCP_KEEPALIVE;
        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        const IDLE_OPT: libc::c_int = libc::TCP_KEEPIDLE;

        if let Some(idle) = idle {
            setsockopt(
                fd,
                libc::IPPROTO_TCP,
                IDLE_OPT,
                idle.as_secs().max(1) as libc::c_int,
            )?;
        }
        if let Some(interval) = interval {
            setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPINTVL,
                interval.as_secs().max(1) as libc::c_int,
            )?;
        }
    }
    Ok(())
}

pub(crate) fn set_linger(fd: RawFd, linger: Option<Duration>) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: linger.is_some() as libc::c_int,
        l_linger: linger.map(|d| d.as_secs() as libc::c_int).unwrap_or(0),
    };
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, linger)
}
