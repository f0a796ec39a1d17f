use std::{fmt, ops};

/// Interest used when subscribing a file descriptor with an event loop.
///
/// Tells the loop which readiness classes to monitor. Hangup and error
/// conditions are always reported and need no explicit interest.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Interest(u8);

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

impl Interest {
    /// Interest in read readiness.
    pub const READABLE: Interest = Interest(READABLE);

    /// Interest in write readiness.
    pub const WRITABLE: Interest = Interest(WRITABLE);

    /// Combines two interests, usable in `const` position.
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Returns true if the interest includes read readiness.
    pub const fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    /// Returns true if the interest includes write readiness.
    pub const fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        self.add(other)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(f, "READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(f, " | ")?;
            }
            write!(f, "WRITABLE")?;
        }
        Ok(())
    }
}

/// Readiness delivered to a subscription callback.
///
/// Like the OS notification it is derived from, readiness is a hint: a
/// subsequent `read`/`write` can still return `WouldBlock` and the caller
/// must retry on the next event.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Readiness(u8);

const R_READABLE: u8 = 0b0_0001;
const R_WRITABLE: u8 = 0b0_0010;
const R_READ_CLOSED: u8 = 0b0_0100;
const R_WRITE_CLOSED: u8 = 0b0_1000;
const R_ERROR: u8 = 0b1_0000;

impl Readiness {
    pub(crate) const EMPTY: Readiness = Readiness(0);

    /// Read readiness.
    pub const READABLE: Readiness = Readiness(R_READABLE);
    /// Write readiness.
    pub const WRITABLE: Readiness = Readiness(R_WRITABLE);
    /// The read half has been closed (peer sent FIN or hung up).
    pub const READ_CLOSED: Readiness = Readiness(R_READ_CLOSED);
    /// The write half has been closed.
    pub const WRITE_CLOSED: Readiness = Readiness(R_WRITE_CLOSED);
    /// An error condition is pending on the descriptor.
    pub const ERROR: Readiness = Readiness(R_ERROR);

    /// Returns true if the value includes read readiness.
    pub const fn is_readable(self) -> bool {
        self.0 & R_READABLE != 0
    }

    /// Returns true if the value includes write readiness.
    pub const fn is_writable(self) -> bool {
        self.0 & R_WRITABLE != 0
    }

    /// Returns true if the read half was closed.
    pub const fn is_read_closed(self) -> bool {
        self.0 & R_READ_CLOSED != 0
    }

    /// Returns true if the write half was closed.
    pub const fn is_write_closed(self) -> bool {
        self.0 & R_WRITE_CLOSED != 0
    }

    /// Returns true if an error condition was reported.
    pub const fn is_error(self) -> bool {
        self.0 & R_ERROR != 0
    }

    pub(crate) const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, other: Readiness) -> Readiness {
        Readiness(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Readiness {
    fn bitor_assign(&mut self, other: Readiness) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        let mut put = |name: &str, set: bool, f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if set {
                if one {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                one = true;
            }
            Ok(())
        };
        put("READABLE", self.is_readable(), f)?;
        put("WRITABLE", self.is_writable(), f)?;
        put("READ_CLOSED", self.is_read_closed(), f)?;
        put("WRITE_CLOSED", self.is_write_closed(), f)?;
        put("ERROR", self.is_error(), f)?;
        if !one {
            write!(f, "(empty)")?;
        }
        Ok(())
    }
}
