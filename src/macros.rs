#![allow(unused_macros)]

/// Helper macro to execute a libc call that returns `-1` on error.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

// Logging shims so the `log` dependency stays optional. With the feature
// disabled these expand to nothing.
macro_rules! trace {
    ($($arg: tt)*) => {{
        #[cfg(feature = "log")]
        log::trace!($($arg)*);
    }};
}

macro_rules! debug {
    ($($arg: tt)*) => {{
        #[cfg(feature = "log")]
        log::debug!($($arg)*);
    }};
}

macro_rules! warn {
    ($($arg: tt)*) => {{
        #[cfg(feature = "log")]
        log::warn!($($arg)*);
    }};
}

macro_rules! error {
    ($($arg: tt)*) => {{
        #[cfg(feature = "log")]
        log::error!($($arg)*);
    }};
}
