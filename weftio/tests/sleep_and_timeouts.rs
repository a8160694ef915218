use std::os::fd::AsRawFd;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use weftio::{Config, Reactor};
use weftio::event::Direction;
use weftio::hooks;

/// Sleeping a fiber parks it on the timer wheel instead of blocking its
/// worker thread: a second fiber scheduled right after keeps running, and
/// the sleeping one only wakes up once its full duration has elapsed.
#[test]
fn sleep_does_not_block_the_worker() {
    let _ = env_logger::try_init();

    let reactor = Reactor::new(Config::new().with_worker_count(1));
    let (tx, rx) = mpsc::channel();

    let started = Instant::now();
    let tx1 = tx.clone();
    reactor.schedule(move || {
        hooks::sleep(Duration::from_millis(60));
        tx1.send(("slept", started.elapsed())).unwrap();
    });

    let tx2 = tx.clone();
    reactor.schedule(move || {
        tx2.send(("immediate", started.elapsed())).unwrap();
    });

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.0, "immediate");
    assert!(first.1 < Duration::from_millis(60));
    assert_eq!(second.0, "slept");
    assert!(second.1 >= Duration::from_millis(60));
    reactor.stop();
}

/// A per-fd read timeout configured via the `setsockopt`-style hook
/// (`hooks::set_timeout`) fires `ETIMEDOUT` on a fd with no pending data,
/// and leaves the reactor with nothing armed on that fd afterward.
///
/// `hooks::pipe` doesn't force the kernel-level fd non-blocking the way
/// `hooks::socket` does (a pipe is never a socket, so `FdCtx` leaves it
/// alone) — so the read end is put in `O_NONBLOCK` directly here, the same
/// way `FdCtx::new` would for a socket, without going through the `fcntl`
/// hook (which would record it as the *application's* request and disable
/// cooperative retries entirely).
#[test]
fn read_with_a_configured_timeout_times_out() {
    let reactor = Reactor::new(Config::new().with_worker_count(1));
    let (read_end, write_end) = hooks::pipe().unwrap();
    let read_fd = read_end.as_raw_fd();
    {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(read_fd) };
        let flags = rustix::io::fcntl_getfl(borrowed).unwrap();
        rustix::io::fcntl_setfl(borrowed, flags | rustix::io::OFlags::NONBLOCK).unwrap();
    }
    hooks::set_timeout(read_fd, Direction::READ, Some(Duration::from_millis(80)));

    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    reactor.schedule(move || {
        let mut buf = [0u8; 8];
        let result = hooks::read(read_fd, &mut buf);
        tx.send((result.map_err(|e| e.kind()), started.elapsed())).unwrap();
    });

    let (result, elapsed) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(result, Err(std::io::ErrorKind::TimedOut));
    assert!(elapsed >= Duration::from_millis(80));
    assert!(elapsed < Duration::from_millis(500));

    drop(write_end);
    reactor.stop();
}
