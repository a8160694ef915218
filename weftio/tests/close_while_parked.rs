use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::mpsc;
use std::time::Duration;

use weftio::hooks;

/// Scenario 6: a fiber genuinely parked on `read(fd)` through the reactor
/// (not just blocked in the kernel) wakes up once another fiber closes the
/// fd out from under it, instead of hanging forever.
///
/// The read end is forced non-blocking directly (bypassing the `fcntl`
/// hook, which would also flip `user_nonblock` and disable cooperative
/// retries) so the first `read` genuinely sees `EAGAIN` and registers with
/// the reactor rather than blocking the OS thread.
#[test]
fn close_wakes_a_fiber_parked_on_read() {
    let _ = env_logger::try_init();

    let (read_end, write_end) = hooks::pipe().unwrap();
    let read_fd = read_end.as_raw_fd();
    {
        let borrowed = unsafe { BorrowedFd::borrow_raw(read_fd) };
        let flags = rustix::io::fcntl_getfl(borrowed).unwrap();
        rustix::io::fcntl_setfl(borrowed, flags | rustix::io::OFlags::NONBLOCK).unwrap();
    }

    let reactor = hooks::global_reactor();
    let (tx, rx) = mpsc::channel();

    reactor.schedule(move || {
        let mut buf = [0u8; 1];
        let result = hooks::read(read_fd, &mut buf);
        tx.send(result.is_err() || result == Ok(0)).unwrap();
    });

    // Give the reader fiber time to hit EAGAIN and register with the
    // reactor before the other side closes the fd out from under it.
    std::thread::sleep(Duration::from_millis(40));
    reactor.schedule(move || {
        hooks::close(read_fd);
    });

    let resumed_cleanly = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(resumed_cleanly);
    drop(write_end);
}
