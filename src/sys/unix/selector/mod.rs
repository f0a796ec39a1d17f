#[cfg(any(target_os = "linux", target_os = "android", target_os = "illumos"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android", target_os = "illumos"))]
pub(crate) use self::epoll::{event, Events, Selector};

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) use self::kqueue::{event, Events, Selector};
