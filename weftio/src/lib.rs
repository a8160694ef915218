//! A user-space cooperative-concurrency runtime for Linux: stackful
//! fibers, a multi-threaded scheduler, and an epoll-backed reactor with
//! hooked blocking primitives (`sleep`, `read`/`write`, `connect`, ...)
//! that park the calling fiber instead of the OS thread underneath it.
//!
//! The low-level machine-context switch lives in the sibling
//! `weftio-fiber` crate; this crate builds the `INIT/READY/RUNNING/
//! HOLD/TERMINATED/EXCEPT` state machine, the scheduling loop, the timer
//! set, and the reactor on top of it.

pub mod config;
pub mod error;
pub mod event;
pub mod fd_table;
pub mod fiber;
pub mod hooks;
pub mod reactor;
pub mod scheduler;
pub mod timer;
pub mod worker;

pub use config::Config;
pub use error::Error;
pub use event::Direction;
pub use fd_table::{FdCtx, FdTable};
pub use fiber::{Fiber, FiberPool, State as FiberState};
pub use reactor::Reactor;
pub use scheduler::Scheduler;
pub use timer::{TimerHeap, TimerId};
pub use worker::ThreadWorker;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    /// End-to-end: two fibers on a reactor, one sleeping, one doing I/O
    /// through the hook layer, both running to completion.
    #[test]
    fn sleep_and_io_coexist_on_one_reactor() {
        let reactor = Reactor::new(Config::new().with_worker_count(2));
        let (done_tx, done_rx) = mpsc::channel();

        let (read_end, write_end) = hooks::pipe().unwrap();
        let read_fd = std::os::fd::AsRawFd::as_raw_fd(&read_end);
        let write_fd = std::os::fd::AsRawFd::as_raw_fd(&write_end);

        let tx1 = done_tx.clone();
        reactor.schedule(move || {
            hooks::sleep(Duration::from_millis(10));
            tx1.send("slept").unwrap();
        });

        let tx2 = done_tx.clone();
        reactor.schedule(move || {
            let mut buf = [0u8; 4];
            let n = hooks::read(read_fd, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"ping");
            tx2.send("read").unwrap();
        });

        std::thread::sleep(Duration::from_millis(30));
        hooks::write(write_fd, b"ping").unwrap();

        let mut results: Vec<&str> = (0..2).map(|_| done_rx.recv().unwrap()).collect();
        results.sort();
        assert_eq!(results, vec!["read", "slept"]);
        reactor.stop();
    }

    /// A fiber parked waiting to read from an fd that gets closed out from
    /// under it wakes up instead of hanging the worker forever.
    #[test]
    fn close_while_parked_wakes_the_waiter() {
        let reactor = Reactor::new(Config::new().with_worker_count(1));
        let (read_end, write_end) = hooks::pipe().unwrap();
        let read_fd = std::os::fd::AsRawFd::as_raw_fd(&read_end);

        let woke = Arc::new(AtomicUsize::new(0));
        let woke2 = woke.clone();
        reactor.schedule(move || {
            let mut buf = [0u8; 1];
            let _ = hooks::read(read_fd, &mut buf);
            woke2.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(20));
        reactor.del_and_trigger_all(read_fd);
        drop(write_end);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(woke.load(Ordering::SeqCst), 1);
        reactor.stop();
    }
}
