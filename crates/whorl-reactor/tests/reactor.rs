//! End-to-end dispatch loop behavior over real pipes and threads.

use std::cell::Cell;
use std::collections::HashSet;
use std::os::unix::io::AsRawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use whorl_reactor::{Interest, LoopThread, Reactor};

#[test]
fn test_readable_descriptor_dispatches_once() {
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = nix::unistd::pipe().unwrap();
    nix::unistd::write(&tx, b"x").unwrap();

    let hits = Rc::new(Cell::new(0u32));
    let seen = Rc::new(Cell::new(Interest::empty()));
    let raw = rx.as_raw_fd();

    let hits_in = Rc::clone(&hits);
    let seen_in = Rc::clone(&seen);
    reactor
        .monitor(raw, Interest::READABLE, move |reactor, fd, ready| {
            assert_eq!(fd, raw);
            hits_in.set(hits_in.get() + 1);
            seen_in.set(ready);
            let mut buf = [0u8; 8];
            nix::unistd::read(fd, &mut buf).unwrap();
            reactor.stop();
        })
        .unwrap();

    reactor.run().unwrap();
    assert_eq!(hits.get(), 1);
    assert!(seen.get().is_readable());
}

#[test]
fn test_first_registration_keeps_winning() {
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = nix::unistd::pipe().unwrap();
    nix::unistd::write(&tx, b"x").unwrap();
    let fd = rx.as_raw_fd();

    let first = Rc::new(Cell::new(0u32));
    let second = Rc::new(Cell::new(0u32));

    let first_in = Rc::clone(&first);
    reactor
        .monitor(fd, Interest::READABLE, move |reactor, fd, _| {
            first_in.set(first_in.get() + 1);
            let mut buf = [0u8; 8];
            nix::unistd::read(fd, &mut buf).unwrap();
            reactor.stop();
        })
        .unwrap();

    // The rejected registration must not disturb the first one.
    let second_in = Rc::clone(&second);
    reactor
        .monitor(fd, Interest::READABLE, move |_, _, _| {
            second_in.set(second_in.get() + 1);
        })
        .unwrap_err();

    reactor.run().unwrap();
    assert_eq!(first.get(), 1);
    assert_eq!(second.get(), 0);
}

#[test]
fn test_multiple_ready_descriptors_all_dispatch() {
    let reactor = Reactor::new().unwrap();
    let (rx_a, tx_a) = nix::unistd::pipe().unwrap();
    let (rx_b, tx_b) = nix::unistd::pipe().unwrap();
    nix::unistd::write(&tx_a, b"x").unwrap();
    nix::unistd::write(&tx_b, b"x").unwrap();

    let total = Rc::new(Cell::new(0u32));
    for rx in [&rx_a, &rx_b] {
        let total = Rc::clone(&total);
        reactor
            .monitor(rx.as_raw_fd(), Interest::READABLE, move |reactor, fd, _| {
                let mut buf = [0u8; 8];
                nix::unistd::read(fd, &mut buf).unwrap();
                total.set(total.get() + 1);
                if total.get() == 2 {
                    reactor.stop();
                }
            })
            .unwrap();
    }

    reactor.run().unwrap();
    assert_eq!(total.get(), 2);
}

#[test]
fn test_removal_suppresses_already_captured_events() {
    let reactor = Reactor::new().unwrap();
    let (rx_a, tx_a) = nix::unistd::pipe().unwrap();
    let (rx_b, tx_b) = nix::unistd::pipe().unwrap();
    nix::unistd::write(&tx_a, b"x").unwrap();
    nix::unistd::write(&tx_b, b"x").unwrap();
    let fd_a = rx_a.as_raw_fd();
    let fd_b = rx_b.as_raw_fd();

    // Both descriptors become ready in the same pass. Whichever handler
    // runs first removes the other, so exactly one may ever fire.
    let fired = Rc::new(Cell::new(0u32));
    let fired_a = Rc::clone(&fired);
    reactor
        .monitor(fd_a, Interest::READABLE, move |reactor, _, _| {
            fired_a.set(fired_a.get() + 1);
            reactor.unmonitor(fd_b);
            reactor.stop();
        })
        .unwrap();
    let fired_b = Rc::clone(&fired);
    reactor
        .monitor(fd_b, Interest::READABLE, move |reactor, _, _| {
            fired_b.set(fired_b.get() + 1);
            reactor.unmonitor(fd_a);
            reactor.stop();
        })
        .unwrap();

    reactor.run().unwrap();
    assert_eq!(fired.get(), 1);
}

#[test]
fn test_swapped_registration_suppresses_stale_events() {
    let reactor = Reactor::new().unwrap();
    let (rx_a, tx_a) = nix::unistd::pipe().unwrap();
    let (rx_b, tx_b) = nix::unistd::pipe().unwrap();
    nix::unistd::write(&tx_a, b"x").unwrap();
    nix::unistd::write(&tx_b, b"x").unwrap();
    let fd_a = rx_a.as_raw_fd();
    let fd_b = rx_b.as_raw_fd();

    let original_a = Rc::new(Cell::new(0u32));
    let original_b = Rc::new(Cell::new(0u32));
    let replacement_a = Rc::new(Cell::new(0u32));
    let replacement_b = Rc::new(Cell::new(0u32));

    // Whichever original handler runs first drains its own descriptor
    // and swaps the other registration for a replacement. The other
    // original handler must never run, even though its readiness was
    // captured in the same pass; the replacement picks the descriptor
    // up on a later pass and stops the loop.
    let orig = Rc::clone(&original_a);
    let repl_hits = Rc::clone(&replacement_b);
    reactor
        .monitor(fd_a, Interest::READABLE, move |reactor, fd, _| {
            orig.set(orig.get() + 1);
            let mut buf = [0u8; 8];
            nix::unistd::read(fd, &mut buf).unwrap();
            reactor.unmonitor(fd_b);
            let hits = Rc::clone(&repl_hits);
            reactor
                .monitor(fd_b, Interest::READABLE, move |reactor, fd, _| {
                    hits.set(hits.get() + 1);
                    let mut buf = [0u8; 8];
                    nix::unistd::read(fd, &mut buf).unwrap();
                    reactor.stop();
                })
                .unwrap();
        })
        .unwrap();

    let orig = Rc::clone(&original_b);
    let repl_hits = Rc::clone(&replacement_a);
    reactor
        .monitor(fd_b, Interest::READABLE, move |reactor, fd, _| {
            orig.set(orig.get() + 1);
            let mut buf = [0u8; 8];
            nix::unistd::read(fd, &mut buf).unwrap();
            reactor.unmonitor(fd_a);
            let hits = Rc::clone(&repl_hits);
            reactor
                .monitor(fd_a, Interest::READABLE, move |reactor, fd, _| {
                    hits.set(hits.get() + 1);
                    let mut buf = [0u8; 8];
                    nix::unistd::read(fd, &mut buf).unwrap();
                    reactor.stop();
                })
                .unwrap();
        })
        .unwrap();

    reactor.run().unwrap();

    // Exactly one original ran; the swapped-out one stayed silent and
    // its replacement saw the data instead.
    assert_eq!(original_a.get() + original_b.get(), 1);
    assert_eq!(replacement_a.get() + replacement_b.get(), 1);
    assert_eq!(original_a.get(), replacement_b.get());
    assert_eq!(original_b.get(), replacement_a.get());
}

#[test]
fn test_handler_can_remove_its_own_registration() {
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = nix::unistd::pipe().unwrap();
    nix::unistd::write(&tx, b"x").unwrap();
    let fd = rx.as_raw_fd();

    let hits = Rc::new(Cell::new(0u32));
    let hits_in = Rc::clone(&hits);
    reactor
        .monitor(fd, Interest::READABLE, move |reactor, fd, _| {
            hits_in.set(hits_in.get() + 1);
            // Data is left in the pipe: removal alone must silence it.
            reactor.unmonitor(fd);
            reactor.stop();
        })
        .unwrap();

    reactor.run().unwrap();
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_handler_panic_unwinds_out_of_run() {
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = nix::unistd::pipe().unwrap();
    nix::unistd::write(&tx, b"x").unwrap();

    reactor
        .monitor(rx.as_raw_fd(), Interest::READABLE, |_, _, _| {
            panic!("handler blew up")
        })
        .unwrap();

    let unwound = catch_unwind(AssertUnwindSafe(|| reactor.run()));
    let payload = unwound.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"handler blew up"));
}

#[test]
fn test_writable_interest_fires() {
    let reactor = Reactor::new().unwrap();
    let (_rx, tx) = nix::unistd::pipe().unwrap();

    let seen = Rc::new(Cell::new(Interest::empty()));
    let seen_in = Rc::clone(&seen);
    reactor
        .monitor(tx.as_raw_fd(), Interest::WRITABLE, move |reactor, fd, ready| {
            seen_in.set(ready);
            reactor.unmonitor(fd);
            reactor.stop();
        })
        .unwrap();

    reactor.run().unwrap();
    assert!(seen.get().is_writable());
}

#[test]
fn test_peer_close_delivers_hangup() {
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = nix::unistd::pipe().unwrap();
    drop(tx);

    let seen = Rc::new(Cell::new(Interest::empty()));
    let seen_in = Rc::clone(&seen);
    reactor
        .monitor(
            rx.as_raw_fd(),
            Interest::READABLE | Interest::HANGUP,
            move |reactor, fd, ready| {
                seen_in.set(ready);
                reactor.unmonitor(fd);
                reactor.stop();
            },
        )
        .unwrap();

    reactor.run().unwrap();
    assert!(seen.get().is_hangup());
}

#[test]
fn test_callbacks_run_in_posting_order_after_handlers() {
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = nix::unistd::pipe().unwrap();
    nix::unistd::write(&tx, b"x").unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let order_in = Arc::clone(&order);
    reactor
        .monitor(rx.as_raw_fd(), Interest::READABLE, move |reactor, fd, _| {
            order_in.lock().unwrap().push("handler");
            let mut buf = [0u8; 8];
            nix::unistd::read(fd, &mut buf).unwrap();
            let first = Arc::clone(&order_in);
            reactor.post(move |_| first.lock().unwrap().push("first"));
            let second = Arc::clone(&order_in);
            reactor.post(move |_| second.lock().unwrap().push("second"));
            reactor.stop();
        })
        .unwrap();

    reactor.run().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["handler", "first", "second"]);
}

#[test]
fn test_stop_is_cooperative() {
    let reactor = Reactor::new().unwrap();

    // Everything is queued before the loop starts; the stop request sits
    // between two callbacks and must not keep either from running.
    let order = Arc::new(Mutex::new(Vec::new()));
    let before = Arc::clone(&order);
    reactor.post(move |_| before.lock().unwrap().push("before-stop"));
    reactor.stop();
    let after = Arc::clone(&order);
    reactor.post(move |_| after.lock().unwrap().push("after-stop"));

    reactor.run().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["before-stop", "after-stop"]);
}

#[test]
fn test_run_after_stop_returns_immediately() {
    let reactor = Reactor::new().unwrap();
    reactor.stop();
    reactor.run().unwrap();
    // The stop latches: running again must not block.
    reactor.run().unwrap();
}

#[test]
fn test_chained_post_runs_on_a_later_pass() {
    let reactor = Reactor::new().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let outer = Arc::clone(&order);
    reactor.post(move |reactor| {
        outer.lock().unwrap().push("outer");
        let inner = Arc::clone(&outer);
        reactor.post(move |reactor| {
            inner.lock().unwrap().push("inner");
            reactor.stop();
        });
    });

    reactor.run().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
}

#[test]
fn test_callbacks_after_shutdown_are_dropped_unrun() {
    let reactor = Reactor::new().unwrap();
    reactor.stop();
    reactor.run().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let ran_in = Arc::clone(&ran);
    reactor.post(move |_| ran_in.store(true, Ordering::SeqCst));
    drop(reactor);
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_handle_outlives_reactor() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    drop(reactor);

    // Posting into the void is quiet; the callback is simply dropped.
    handle.post(|_| {});
    handle.stop();
}

#[test]
fn test_posts_from_many_threads_all_run_on_dispatcher() {
    let loop_thread = LoopThread::spawn(|_| Ok(())).unwrap();
    let handle = loop_thread.handle();

    let executed = Arc::new(AtomicUsize::new(0));
    let seen_threads = Arc::new(Mutex::new(HashSet::new()));

    let mut producers = Vec::new();
    for _ in 0..10 {
        let handle = handle.clone();
        let executed = Arc::clone(&executed);
        let seen_threads = Arc::clone(&seen_threads);
        producers.push(thread::spawn(move || {
            for _ in 0..100 {
                let executed = Arc::clone(&executed);
                let seen_threads = Arc::clone(&seen_threads);
                handle.post(move |_| {
                    executed.fetch_add(1, Ordering::Relaxed);
                    seen_threads.lock().unwrap().insert(thread::current().id());
                });
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    // The stop request is posted after every producer finished, so all
    // 1000 callbacks drain before the loop exits.
    loop_thread.shutdown().unwrap();

    assert_eq!(executed.load(Ordering::Relaxed), 1000);
    let seen = seen_threads.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(!seen.contains(&thread::current().id()));
}
