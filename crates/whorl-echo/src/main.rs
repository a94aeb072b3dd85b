//! whorl-echo - Nonblocking TCP echo server on a single dispatch loop.
//!
//! Usage:
//!   whorl-echo --listen 127.0.0.1:2233
//!
//! Every connection is served by the same thread: the listener and each
//! client socket are registered with the reactor, and SIGINT/SIGTERM
//! arrive through a signalfd monitored like any other descriptor.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsFd, AsRawFd};

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use whorl_reactor::{Interest, Reactor};

#[derive(Parser)]
#[command(name = "whorl-echo")]
#[command(version, about = "Nonblocking TCP echo server", long_about = None)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "WHORL_LISTEN", default_value = "127.0.0.1:2233")]
    listen: String,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let addr = cli
        .listen
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve listen address: {}", cli.listen))?
        .next()
        .context("Listen address resolved to nothing")?;

    let listener =
        TcpListener::bind(addr).with_context(|| format!("Failed to bind {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("Failed to make listener nonblocking")?;

    let reactor = Reactor::new().context("Failed to create dispatch loop")?;
    install_signal_stop(&reactor).context("Failed to install signal handling")?;
    register_listener(&reactor, listener)?;

    info!(addr = %addr, "Listening");
    reactor.run().context("Dispatch loop failed")?;
    info!("Shut down");
    Ok(())
}

/// Route SIGINT/SIGTERM through the loop: the signals are blocked for
/// the process and surface as readiness on a signalfd instead.
fn install_signal_stop(reactor: &Reactor) -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().context("Failed to block signals")?;

    let mut sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .context("Failed to create signalfd")?;
    let fd = sfd.as_fd().as_raw_fd();

    reactor.monitor(fd, Interest::READABLE, move |reactor, _, _| {
        loop {
            match sfd.read_signal() {
                Ok(Some(info)) => info!(signal = info.ssi_signo, "Caught signal, stopping"),
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "Reading signalfd failed");
                    break;
                }
            }
        }
        reactor.stop();
    })?;
    Ok(())
}

/// Accept until the backlog is empty; each connection gets its own echo
/// handler on the same loop.
fn register_listener(reactor: &Reactor, listener: TcpListener) -> Result<()> {
    let fd = listener.as_raw_fd();
    reactor.monitor(fd, Interest::READABLE, move |reactor, fd, _| loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = register_client(reactor, stream, peer) {
                    warn!(peer = %peer, error = %err, "Failed to register connection");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) => {
                error!(error = %err, "Accept failed, shutting down");
                reactor.unmonitor(fd);
                reactor.stop();
                break;
            }
        }
    })?;
    Ok(())
}

/// Echo whatever arrives back to the peer. The handler owns the stream;
/// removing the registration drops it and closes the socket.
fn register_client(reactor: &Reactor, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    stream
        .set_nonblocking(true)
        .context("Failed to make connection nonblocking")?;
    let fd = stream.as_raw_fd();
    info!(peer = %peer, fd, "Connection opened");

    reactor.monitor(fd, Interest::READABLE | Interest::HANGUP, move |reactor, fd, ready| {
        if ready.is_hangup() || ready.is_error() {
            info!(fd, "Connection closed");
            reactor.unmonitor(fd);
            return;
        }
        let mut buf = [0u8; 1024];
        match stream.read(&mut buf) {
            Ok(0) => {
                info!(fd, "Connection closed");
                reactor.unmonitor(fd);
            }
            Ok(n) => {
                if let Err(err) = stream.write_all(&buf[..n]) {
                    warn!(fd, error = %err, "Echo write failed");
                    reactor.unmonitor(fd);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(fd, error = %err, "Read failed");
                reactor.unmonitor(fd);
            }
        }
    })?;
    Ok(())
}
