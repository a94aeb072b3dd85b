//! # whorl-reactor
//!
//! A single-threaded, readiness-driven I/O event dispatcher over Linux
//! epoll.
//!
//! The [`Reactor`] multiplexes an arbitrary set of file descriptors and
//! invokes a per-descriptor handler whenever the kernel reports
//! readiness. Any thread may inject work onto the dispatcher thread
//! through a cloneable [`Handle`], which is also how the loop is asked
//! to stop.
//!
//! ## Model
//!
//! ```text
//! other threads --- Handle::post / Handle::stop ---> queue
//!                                                      |  (eventfd wake-up)
//!                                                      v
//! dispatcher thread: epoll_wait -> readiness handlers -> drain callbacks -> repeat
//! ```
//!
//! Registration ([`Reactor::monitor`] / [`Reactor::unmonitor`]) and the
//! loop itself belong to the dispatcher thread alone; `Reactor` is
//! `!Send`, so the compiler enforces that split. Handlers receive
//! `&Reactor` and may re-enter it freely to register new descriptors,
//! drop others, post callbacks, or request a stop.
//!
//! The reactor never owns the descriptors it watches: callers keep them
//! open while monitored and close them after `unmonitor`.
//!
//! ## Example
//!
//! ```no_run
//! use std::os::unix::io::AsRawFd;
//! use whorl_reactor::{Interest, Reactor};
//!
//! fn main() -> whorl_reactor::Result<()> {
//!     let (rx, _tx) = nix::unistd::pipe().expect("pipe");
//!     let reactor = Reactor::new()?;
//!     reactor.monitor(rx.as_raw_fd(), Interest::READABLE, |reactor, fd, _ready| {
//!         println!("descriptor {fd} is readable");
//!         reactor.stop();
//!     })?;
//!     reactor.run()
//! }
//! ```
//!
//! Linux-only: readiness comes from epoll and the wake-up channel is an
//! eventfd.

mod handle;
mod interest;
mod reactor;
mod thread;

pub use handle::Handle;
pub use interest::Interest;
pub use reactor::Reactor;
pub use thread::LoopThread;

use std::os::unix::io::RawFd;

use thiserror::Error;

/// Errors surfaced by reactor construction, descriptor registration,
/// and the dispatch loop.
#[derive(Error, Debug)]
pub enum ReactorError {
    /// Creating the epoll context or the wake-up eventfd failed.
    #[error("failed to set up readiness context: {0}")]
    Init(#[source] nix::errno::Errno),

    /// The descriptor already has a handler; `unmonitor` it first.
    #[error("descriptor {0} is already monitored")]
    AlreadyMonitored(RawFd),

    /// The kernel rejected an epoll subscription change.
    #[error("failed to update readiness subscription for descriptor {fd}: {source}")]
    Subscription { fd: RawFd, source: nix::errno::Errno },

    /// The readiness wait failed for a reason other than interruption.
    #[error("readiness wait failed: {0}")]
    Wait(#[source] nix::errno::Errno),

    /// The dispatcher thread could not be spawned.
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReactorError>;
