//! An owned dispatcher thread: the reactor is built on a fresh thread,
//! runs there, and is stopped and joined on shutdown.

use std::sync::mpsc;
use std::thread;

use tracing::debug;

use crate::handle::Handle;
use crate::reactor::Reactor;
use crate::{ReactorError, Result};

/// A reactor running on its own named thread.
///
/// The reactor never leaves that thread (it cannot, being `!Send`);
/// [`spawn`](LoopThread::spawn) runs the caller's `init` there for
/// initial registrations and hands back a [`Handle`]. Dropping a
/// `LoopThread` stops the loop and joins the thread.
pub struct LoopThread {
    handle: Handle,
    thread: Option<thread::JoinHandle<Result<()>>>,
}

impl LoopThread {
    /// Spawn the dispatcher thread, build a reactor on it, run `init`
    /// with the new reactor, then enter the dispatch loop.
    ///
    /// Errors from reactor construction or from `init` are returned
    /// here and the thread exits without ever running the loop. A panic
    /// in `init` is resumed on the calling thread.
    pub fn spawn<F>(init: F) -> Result<Self>
    where
        F: FnOnce(&Reactor) -> Result<()> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("whorl-reactor".to_string())
            .spawn(move || {
                let reactor = match Reactor::new() {
                    Ok(reactor) => reactor,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return Ok(());
                    }
                };
                if let Err(err) = init(&reactor) {
                    let _ = ready_tx.send(Err(err));
                    return Ok(());
                }
                let _ = ready_tx.send(Ok(reactor.handle()));
                reactor.run()
            })
            .map_err(ReactorError::Spawn)?;

        match ready_rx.recv() {
            Ok(Ok(handle)) => Ok(Self {
                handle,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            // The channel closed without a message: `init` (or reactor
            // construction) panicked before reporting readiness.
            Err(_) => match thread.join() {
                Err(panic) => std::panic::resume_unwind(panic),
                Ok(_) => unreachable!("dispatcher thread exited without reporting readiness"),
            },
        }
    }

    /// The cross-thread capability for this loop.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stop the loop and join the dispatcher thread, returning the
    /// loop's exit result. A panic on the dispatcher thread is resumed
    /// here.
    pub fn shutdown(mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.handle.stop();
        match thread.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.handle.stop();
        if thread.join().is_err() {
            debug!("dispatcher thread panicked before shutdown");
        }
    }
}
