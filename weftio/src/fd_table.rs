//! Per-fd bookkeeping shared across every hook: whether a fd is a socket
//! (sockets get forced into non-blocking mode so the reactor can drive
//! them; regular files are left alone), whether *we* forced non-blocking
//! or the application asked for it itself, and any `SO_RCVTIMEO`/
//! `SO_SNDTIMEO`-style per-direction timeout the application set via the
//! `setsockopt` hook.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use rustix::fd::BorrowedFd;
use rustix::fs::FileType;
use rustix::io::{fcntl_getfl, fcntl_setfl, OFlags};

use crate::event::Direction;

/// Tracked state for a single open file descriptor.
pub struct FdCtx {
    fd: i32,
    is_socket: bool,
    is_closed: AtomicBool,
    /// Whether the fd is non-blocking because we forced it (sockets
    /// always are, from the moment their `FdCtx` is created).
    sys_nonblock: AtomicBool,
    /// Whether the application itself asked for `O_NONBLOCK` via the
    /// `fcntl` hook. When true, hooked I/O calls must preserve `EAGAIN`
    /// instead of silently retrying through the reactor.
    user_nonblock: AtomicBool,
    recv_timeout_ms: AtomicI64,
    send_timeout_ms: AtomicI64,
}

impl FdCtx {
    fn new(fd: i32) -> Self {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let is_socket = rustix::fs::fstat(borrowed)
            .map(|stat| FileType::from_raw_mode(stat.st_mode).is_socket())
            .unwrap_or(false);

        let mut already_nonblock = fcntl_getfl(borrowed)
            .map(|flags| flags.contains(OFlags::NONBLOCK))
            .unwrap_or(false);

        if is_socket && !already_nonblock {
            if let Ok(flags) = fcntl_getfl(borrowed) {
                let _ = fcntl_setfl(borrowed, flags | OFlags::NONBLOCK);
                already_nonblock = true;
            }
        }

        Self {
            fd,
            is_socket,
            is_closed: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(is_socket && already_nonblock),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(-1),
            send_timeout_ms: AtomicI64::new(-1),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }

    /// True if this fd should be treated as non-blocking by hooks that
    /// need to decide whether `EAGAIN` should be handed straight back to
    /// the caller instead of being absorbed into the reactor wait.
    pub fn effective_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, value: bool) {
        self.user_nonblock.store(value, Ordering::Release);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn set_timeout(&self, direction: Direction, ms: i64) {
        if direction.contains(Direction::READ) {
            self.recv_timeout_ms.store(ms, Ordering::Release);
        }
        if direction.contains(Direction::WRITE) {
            self.send_timeout_ms.store(ms, Ordering::Release);
        }
    }

    /// The configured timeout for `direction`, if any. When both `READ`
    /// and `WRITE` are set, the smaller of the two applies.
    pub fn timeout(&self, direction: Direction) -> Option<Duration> {
        let mut candidates = Vec::with_capacity(2);
        if direction.contains(Direction::READ) {
            candidates.push(self.recv_timeout_ms.load(Ordering::Acquire));
        }
        if direction.contains(Direction::WRITE) {
            candidates.push(self.send_timeout_ms.load(Ordering::Acquire));
        }
        candidates
            .into_iter()
            .filter(|&ms| ms >= 0)
            .min()
            .map(|ms| Duration::from_millis(ms as u64))
    }
}

/// A process-wide registry of [`FdCtx`]es, indexed by fd number.
#[derive(Default)]
pub struct FdTable {
    inner: Mutex<HashMap<i32, Arc<FdCtx>>>,
}

impl FdTable {
    /// The single process-wide table every hook function consults.
    pub fn global() -> &'static FdTable {
        static TABLE: OnceLock<FdTable> = OnceLock::new();
        TABLE.get_or_init(FdTable::default)
    }

    /// Looks up `fd` without creating an entry for it.
    pub fn get(&self, fd: i32) -> Option<Arc<FdCtx>> {
        self.inner.lock().unwrap().get(&fd).cloned()
    }

    /// Registers a freshly minted fd (one just returned by `socket`,
    /// `pipe`, or `accept`), replacing any stale entry for the same
    /// number left behind by a fd the kernel has since recycled.
    pub fn create(&self, fd: i32) -> Arc<FdCtx> {
        let ctx = Arc::new(FdCtx::new(fd));
        self.inner.lock().unwrap().insert(fd, ctx.clone());
        ctx
    }

    /// Looks up `fd`, lazily `fstat`-ing and registering it on first use.
    /// Used by hooks that operate on fds the application may not have
    /// opened through `socket`/`pipe`/`accept` (so may not be registered
    /// yet), unlike those three which always go through `create`.
    pub fn get_or_create(&self, fd: i32) -> Arc<FdCtx> {
        if let Some(ctx) = self.get(fd) {
            return ctx;
        }
        // Built before the lock is taken: `FdCtx::new` calls into `rustix`
        // directly rather than through the hooks, so it can't re-enter this
        // table. Losing the construction race to another thread just means
        // discarding the redundant `FdCtx`.
        let ctx = Arc::new(FdCtx::new(fd));
        self.inner.lock().unwrap().entry(fd).or_insert(ctx).clone()
    }

    /// Removes `fd`'s entry, e.g. once the `close` hook has run. Returns
    /// it so the caller can still inspect it (marking it closed) even
    /// though it is no longer reachable by fd number.
    pub fn del(&self, fd: i32) -> Option<Arc<FdCtx>> {
        let removed = self.inner.lock().unwrap().remove(&fd);
        if let Some(ctx) = &removed {
            ctx.mark_closed();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipes_are_not_sockets_and_not_forced_nonblocking() {
        let (read_fd, write_fd) = rustix::pipe::pipe().unwrap();
        let table = FdTable::default();
        let ctx = table.get_or_create(
            std::os::fd::AsRawFd::as_raw_fd(&read_fd),
        );
        assert!(!ctx.is_socket());
        drop(write_fd);
    }

    #[test]
    fn timeouts_round_trip() {
        let ctx = FdCtx::new(0);
        ctx.set_timeout(Direction::READ, 1_500);
        assert_eq!(ctx.timeout(Direction::READ), Some(Duration::from_millis(1_500)));
        assert_eq!(ctx.timeout(Direction::WRITE), None);
    }

    #[test]
    fn del_marks_the_removed_entry_closed() {
        let table = FdTable::default();
        let ctx = table.get_or_create(0);
        assert!(!ctx.is_closed());
        let removed = table.del(0).unwrap();
        assert!(removed.is_closed());
        assert!(table.get(0).is_none());
    }
}
