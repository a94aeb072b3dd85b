//! Cross-thread machinery: the deferred-callback queue, the eventfd
//! wake-up channel, and the [`Handle`] other threads use to reach the
//! dispatcher.

use std::fmt;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};
use tracing::debug;

use crate::reactor::Reactor;
use crate::{ReactorError, Result};

/// A deferred unit of work, executed once on the dispatcher thread.
pub(crate) type Callback = Box<dyn FnOnce(&Reactor) + Send + 'static>;

/// The wake-up channel. A non-zero eventfd counter means "at least one
/// post happened since the last drain" and reads as readable to epoll.
pub(crate) struct WakeFd {
    inner: EventFd,
}

impl WakeFd {
    pub(crate) fn new() -> Result<Self> {
        let inner = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(ReactorError::Init)?;
        Ok(Self { inner })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.inner.as_fd().as_raw_fd()
    }

    /// Bump the counter so a blocked `epoll_wait` observes readiness.
    pub(crate) fn notify(&self) {
        // The only write failure on a non-blocking eventfd is a saturated
        // counter, which still reads as ready.
        if let Err(err) = self.inner.arm() {
            debug!(error = %err, "wake-up signal failed");
        }
    }

    /// Read and discard the counter. `EAGAIN` means nothing was pending.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 8];
        match nix::unistd::read(self.as_raw_fd(), &mut buf) {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(err) => debug!(error = %err, "wake-up drain failed"),
        }
    }
}

/// State shared between the dispatcher thread and every [`Handle`].
pub(crate) struct Shared {
    queue: Mutex<Vec<Callback>>,
    wake: WakeFd,
    stopped: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            queue: Mutex::new(Vec::new()),
            wake: WakeFd::new()?,
            stopped: AtomicBool::new(false),
        })
    }

    pub(crate) fn wake_fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }

    pub(crate) fn drain_wake(&self) {
        self.wake.drain();
    }

    /// Append a callback, then signal the wake-up channel. The lock is
    /// released before the signal and is never held while callbacks run.
    pub(crate) fn enqueue(&self, callback: Callback) {
        self.queue.lock().unwrap().push(callback);
        self.wake.notify();
    }

    /// Swap the whole queue out, leaving it empty for new posts.
    pub(crate) fn take_queue(&self) -> Vec<Callback> {
        std::mem::take(&mut *self.queue.lock().unwrap())
    }

    /// Post a callback that flips the stop flag. The flag latches.
    pub(crate) fn request_stop(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        self.enqueue(Box::new(move |_| {
            shared.stopped.store(true, Ordering::Release);
        }));
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// A cloneable, thread-safe capability for reaching the dispatcher
/// thread: [`post`](Handle::post) injects work and
/// [`stop`](Handle::stop) asks the loop to finish.
///
/// Handles stay valid after the reactor is gone. Posting then appends to
/// a queue nobody drains any more; those callbacks are dropped, never
/// run, when the last handle goes away.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Queue `callback` for execution on the dispatcher thread and wake
    /// the loop. Callbacks run in posting order, after the readiness
    /// handlers of the iteration that drains them. The queue is
    /// unbounded; posting never blocks beyond the queue lock.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce(&Reactor) + Send + 'static,
    {
        self.shared.enqueue(Box::new(callback));
    }

    /// Ask the dispatch loop to finish. The stop is cooperative: it is
    /// itself a posted callback, so handlers and callbacks already in
    /// flight complete first and the loop exits at its next condition
    /// check. A stopped reactor stays stopped.
    pub fn stop(&self) {
        self.shared.request_stop();
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}
