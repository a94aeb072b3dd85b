//! The reactor: descriptor registry and the dispatch loop.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollTimeout};
use tracing::{debug, trace};

use crate::handle::{Handle, Shared};
use crate::interest::Interest;
use crate::{ReactorError, Result};

type HandlerSlot = Rc<RefCell<dyn FnMut(&Reactor, RawFd, Interest)>>;

/// One registered descriptor. The stamp is unique per registration and
/// tells events captured for an earlier registration of the same
/// descriptor number apart from the current one.
struct Registration {
    handler: HandlerSlot,
    stamp: u64,
}

/// One captured readiness event: descriptor, delivered mask, and the
/// registration stamp observed at capture time.
struct Captured {
    fd: RawFd,
    ready: Interest,
    stamp: u64,
}

/// A single-threaded, readiness-driven event dispatcher.
///
/// The thread that constructs the reactor registers descriptors with
/// [`monitor`](Reactor::monitor) and drives them with
/// [`run`](Reactor::run). The type is `!Send`; other threads interact
/// only through the [`Handle`] returned by [`handle`](Reactor::handle).
///
/// Dropping the reactor closes its epoll context, drops every registered
/// handler (and whatever those closures own), and discards callbacks
/// still queued once the last `Handle` is gone.
pub struct Reactor {
    epoll: Epoll,
    registry: RefCell<HashMap<RawFd, Registration>>,
    /// Scratch buffer for the wait call, grown to the registration count
    /// each iteration so one wait can report every descriptor at once.
    events: RefCell<Vec<EpollEvent>>,
    next_stamp: Cell<u64>,
    shared: Arc<Shared>,
}

/// Treat a caller-provided descriptor as borrowed for one epoll call.
/// Callers have already screened out negative values, which
/// `BorrowedFd` cannot hold.
fn borrowed(fd: RawFd) -> BorrowedFd<'static> {
    // SAFETY: only used for the duration of a single epoll_ctl call; the
    // registration contract keeps the descriptor open in the meantime.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl Reactor {
    /// Create the epoll context and the wake-up channel, and register
    /// the wake-up descriptor like any other. Either resource failing to
    /// come up is fatal.
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(ReactorError::Init)?;
        let shared = Arc::new(Shared::new()?);

        let reactor = Self {
            epoll,
            registry: RefCell::new(HashMap::new()),
            events: RefCell::new(Vec::new()),
            next_stamp: Cell::new(0),
            shared,
        };

        let wake = Arc::clone(&reactor.shared);
        reactor.monitor(reactor.shared.wake_fd(), Interest::READABLE, move |_, _, ready| {
            if ready.is_readable() {
                wake.drain_wake();
            }
        })?;
        Ok(reactor)
    }

    /// Register `handler` for readiness events on `fd`.
    ///
    /// The reactor takes no ownership of `fd`: it must stay open while
    /// monitored, and closing it remains the caller's job after
    /// [`unmonitor`](Reactor::unmonitor). The handler runs on the
    /// dispatcher thread only, is handed this reactor for reentrant
    /// calls, and must not block.
    ///
    /// Fails with [`ReactorError::AlreadyMonitored`] if `fd` already has
    /// a handler (the existing registration stays in effect) and with
    /// [`ReactorError::Subscription`] if `fd` is not a plausible
    /// descriptor or the kernel rejects the epoll update; in both cases
    /// the registry is unchanged.
    pub fn monitor<H>(&self, fd: RawFd, interest: Interest, handler: H) -> Result<()>
    where
        H: FnMut(&Reactor, RawFd, Interest) + 'static,
    {
        // `BorrowedFd` cannot hold a negative value; fail with the errno
        // the kernel would use.
        if fd < 0 {
            return Err(ReactorError::Subscription { fd, source: Errno::EBADF });
        }
        let mut registry = self.registry.borrow_mut();
        if registry.contains_key(&fd) {
            return Err(ReactorError::AlreadyMonitored(fd));
        }

        let event = EpollEvent::new(interest.to_epoll(), fd as u64);
        self.epoll
            .add(borrowed(fd), event)
            .map_err(|source| ReactorError::Subscription { fd, source })?;

        let stamp = self.next_stamp.get();
        self.next_stamp.set(stamp.wrapping_add(1));
        registry.insert(
            fd,
            Registration {
                handler: Rc::new(RefCell::new(handler)),
                stamp,
            },
        );
        trace!(fd, interest = ?interest, "monitoring descriptor");
        Ok(())
    }

    /// Stop monitoring `fd`. Unknown descriptors are a no-op, so the
    /// call is idempotent. Once it returns, the handler will not run
    /// again, including for events already captured in the current
    /// iteration.
    pub fn unmonitor(&self, fd: RawFd) {
        let removed = self.registry.borrow_mut().remove(&fd);
        if removed.is_none() {
            trace!(fd, "unmonitor of unregistered descriptor");
            return;
        }
        if let Err(err) = self.epoll.delete(borrowed(fd)) {
            // Happens when the caller closed the descriptor before
            // unregistering; the kernel already dropped it from the set.
            debug!(fd, error = %err, "epoll delete failed");
        }
        trace!(fd, "stopped monitoring descriptor");
    }

    /// Queue `callback` for execution at the end of a loop iteration.
    /// Same operation as [`Handle::post`], without leaving the thread.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce(&Reactor) + Send + 'static,
    {
        self.shared.enqueue(Box::new(callback));
    }

    /// Ask the loop to finish once the current iteration completes. Same
    /// operation as [`Handle::stop`].
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// A cloneable capability for posting work and stopping the loop
    /// from other threads.
    pub fn handle(&self) -> Handle {
        Handle::new(Arc::clone(&self.shared))
    }

    /// Run the dispatch loop until a stop request takes effect.
    ///
    /// Blocks the calling thread. Each iteration waits without timeout
    /// for readiness, invokes the matching handlers strictly
    /// sequentially, then drains the deferred-callback queue in posting
    /// order. Interrupted and empty waits re-enter the loop; any other
    /// wait failure is returned. A panic in a handler or callback is not
    /// caught and unwinds out of this call.
    pub fn run(&self) -> Result<()> {
        debug!("dispatch loop running");
        while !self.shared.is_stopped() {
            self.turn()?;
        }
        debug!("dispatch loop stopped");
        Ok(())
    }

    /// One iteration: wait, dispatch the captured batch, drain
    /// callbacks.
    fn turn(&self) -> Result<()> {
        for captured in self.wait()? {
            self.dispatch(captured);
        }
        for callback in self.shared.take_queue() {
            callback(self);
        }
        Ok(())
    }

    /// Block until readiness, then snapshot (fd, mask, stamp) triples.
    /// The buffer holds one slot per registered descriptor, the most one
    /// wait can report.
    fn wait(&self) -> Result<Vec<Captured>> {
        let mut events = self.events.borrow_mut();
        let registered = self.registry.borrow().len();
        events.resize(registered.max(1), EpollEvent::empty());

        let count = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(count) => count,
            Err(Errno::EINTR) => {
                trace!("readiness wait interrupted");
                0
            }
            Err(err) => return Err(ReactorError::Wait(err)),
        };

        let registry = self.registry.borrow();
        let mut batch = Vec::with_capacity(count);
        for event in events.iter().take(count) {
            let fd = event.data() as RawFd;
            if let Some(registration) = registry.get(&fd) {
                batch.push(Captured {
                    fd,
                    ready: Interest::from_epoll(event.events()),
                    stamp: registration.stamp,
                });
            }
        }
        Ok(batch)
    }

    /// Invoke the handler for one captured event, unless the
    /// registration was removed or replaced since capture.
    fn dispatch(&self, captured: Captured) {
        let handler = {
            let registry = self.registry.borrow();
            match registry.get(&captured.fd) {
                Some(registration) if registration.stamp == captured.stamp => {
                    Rc::clone(&registration.handler)
                }
                _ => {
                    trace!(fd = captured.fd, "skipping stale readiness event");
                    return;
                }
            }
        };
        // No registry borrow is held here, so the handler may re-enter
        // monitor/unmonitor; the clone keeps a handler that unregisters
        // itself alive until it returns.
        (&mut *handler.borrow_mut())(self, captured.fd, captured.ready);
    }
}
