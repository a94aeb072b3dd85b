//! Readiness flags, used both for registration and delivery.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use nix::sys::epoll::EpollFlags;

/// A small set of readiness flags.
///
/// The same type declares interest when a descriptor is registered and
/// describes what fired when a handler is invoked. Error and hang-up
/// conditions are always delivered regardless of the interest requested,
/// mirroring epoll. Kernel bits with no equivalent here are dropped on
/// delivery, so a handler never sees flags it cannot interpret.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    /// The descriptor has data to read.
    pub const READABLE: Self = Self(0b0001);
    /// The descriptor can accept writes.
    pub const WRITABLE: Self = Self(0b0010);
    /// An error condition was reported.
    pub const ERROR: Self = Self(0b0100);
    /// The peer closed its end, or the descriptor hung up.
    pub const HANGUP: Self = Self(0b1000);

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns true if no flags are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every flag in `other` is also set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub const fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    pub const fn is_hangup(self) -> bool {
        self.contains(Self::HANGUP)
    }

    /// The epoll event mask to subscribe with.
    pub(crate) fn to_epoll(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.is_readable() {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.is_writable() {
            flags |= EpollFlags::EPOLLOUT;
        }
        // EPOLLERR and EPOLLHUP are implicit for every subscription;
        // peer shutdown is the only condition that must be asked for.
        if self.is_hangup() {
            flags |= EpollFlags::EPOLLRDHUP;
        }
        flags
    }

    /// Translate a delivered epoll mask, dropping unrecognized bits.
    pub(crate) fn from_epoll(flags: EpollFlags) -> Self {
        let mut ready = Self::empty();
        if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI) {
            ready |= Self::READABLE;
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            ready |= Self::WRITABLE;
        }
        if flags.contains(EpollFlags::EPOLLERR) {
            ready |= Self::ERROR;
        }
        if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP) {
            ready |= Self::HANGUP;
        }
        ready
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(empty)");
        }
        let mut sep = "";
        for (flag, name) in [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::ERROR, "ERROR"),
            (Self::HANGUP, "HANGUP"),
        ] {
            if self.contains(flag) {
                write!(f, "{sep}{name}")?;
                sep = " | ";
            }
        }
        Ok(())
    }
}
