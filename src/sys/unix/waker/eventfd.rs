use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Waker backed by `eventfd(2)`.
///
/// The eventfd is a 64-bit counter; each wake adds one, each ack reads
/// (and thereby resets) the count.
#[derive(Debug)]
pub(crate) struct WakerInternal {
    fd: File,
}

impl WakerInternal {
    pub(crate) fn new() -> io::Result<WakerInternal> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` returned a fresh, valid fd.
        let fd = unsafe { File::from_raw_fd(fd) };
        Ok(WakerInternal { fd })
    }

    #[allow(clippy::unused_io_amount)] // Writes of 8 bytes don't split.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The counter is about to overflow; reset and retry.
                self.ack();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    #[allow(clippy::unused_io_amount)]
    pub(crate) fn ack(&self) {
        let mut buf: [u8; 8] = [0; 8];
        // A `WouldBlock` here just means nobody woke us; ignore it.
        let _ = (&self.fd).read(&mut buf);
    }
}

impl AsRawFd for WakerInternal {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
