//! Cooperative replacements for the blocking primitives a fiber would
//! otherwise stall its whole worker thread on. Each of these parks the
//! *fiber*, not the thread, by falling back to
//! [`Reactor::wait_for`](crate::reactor::Reactor::wait_for) whenever the
//! underlying syscall reports `EAGAIN`/`EINPROGRESS`.
//!
//! These are ordinary Rust functions an application calls in place of the
//! blocking ones, rather than symbols interposed over libc via
//! `dlsym(RTLD_NEXT, ...)`: call sites are already statically known, so
//! interposition would only add the burden of matching the exact C ABI
//! and errno contract for no benefit.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rustix::io::Errno;

use crate::config::Config;
use crate::error::Error;
use crate::event::Direction;
use crate::fd_table::FdTable;
use crate::reactor::Reactor;

static REACTOR: OnceLock<Arc<Reactor>> = OnceLock::new();

/// Installs the reactor hooked I/O runs against. Must be called at most
/// once, before any hook function; later calls are ignored (the reactor
/// that won the race is what every hook will see).
pub fn init(config: Config) -> Arc<Reactor> {
    REACTOR.get_or_init(|| Reactor::new(config)).clone()
}

/// The reactor hooks run against, lazily constructed with default
/// settings if [`init`] was never called.
pub fn global_reactor() -> Arc<Reactor> {
    REACTOR.get_or_init(|| Reactor::new(Config::default())).clone()
}

/// Parks the calling fiber for `duration` without blocking its worker
/// thread. Covers the `sleep`/`usleep`/`nanosleep` family.
pub fn sleep(duration: Duration) {
    global_reactor().sleep_ms(duration.as_millis() as u64);
}

/// Retries `attempt` through the reactor whenever it reports `EAGAIN`,
/// unless the fd has been put in genuinely non-blocking mode by the
/// application itself (via [`fcntl_setfl`]), in which case `EAGAIN` is
/// handed straight back.
fn do_io<T>(
    fd: i32,
    direction: Direction,
    mut attempt: impl FnMut() -> Result<T, Errno>,
) -> io::Result<T> {
    let ctx = FdTable::global().get_or_create(fd);
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(Errno::AGAIN) if !ctx.effective_nonblock() => {
                match global_reactor().wait_for(fd, direction, ctx.timeout(direction)) {
                    Ok(()) => continue,
                    Err(Error::Timeout { .. }) => return Err(io::ErrorKind::TimedOut.into()),
                    Err(other) => return Err(other.into()),
                }
            }
            Err(errno) => return Err(errno.into()),
        }
    }
}

pub fn socket(
    domain: rustix::net::AddressFamily,
    kind: rustix::net::SocketType,
    protocol: Option<rustix::net::Protocol>,
) -> io::Result<OwnedFd> {
    let fd = rustix::net::socket(domain, kind, protocol)?;
    FdTable::global().create(fd.as_raw_fd());
    Ok(fd)
}

pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = rustix::pipe::pipe()?;
    FdTable::global().create(read_end.as_raw_fd());
    FdTable::global().create(write_end.as_raw_fd());
    Ok((read_end, write_end))
}

pub fn accept(listener_fd: i32) -> io::Result<(OwnedFd, rustix::net::SocketAddrAny)> {
    let (conn, addr) = do_io(listener_fd, Direction::READ, || {
        let borrowed = unsafe { BorrowedFd::borrow_raw(listener_fd) };
        rustix::net::accept_any(borrowed)
    })?;
    FdTable::global().create(conn.as_raw_fd());
    Ok((conn, addr))
}

/// Closes `fd`, waking (without an error) any fiber currently parked on
/// it so it can observe the close on its own next I/O attempt.
pub fn close(fd: i32) -> io::Result<()> {
    global_reactor().del_and_trigger_all(fd);
    FdTable::global().del(fd);
    // Safety: the caller is relinquishing `fd`; nothing above retains it
    // as an owned value (the fd table only ever stored the bookkeeping,
    // never an `OwnedFd`).
    unsafe { rustix::io::close(fd) };
    Ok(())
}

pub fn read(fd: i32, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, Direction::READ, || {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        rustix::io::read(borrowed, buf)
    })
}

pub fn write(fd: i32, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, Direction::WRITE, || {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        rustix::io::write(borrowed, buf)
    })
}

pub fn recv(fd: i32, buf: &mut [u8], flags: rustix::net::RecvFlags) -> io::Result<usize> {
    do_io(fd, Direction::READ, || {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        rustix::net::recv(borrowed, buf, flags)
    })
}

pub fn send(fd: i32, buf: &[u8], flags: rustix::net::SendFlags) -> io::Result<usize> {
    do_io(fd, Direction::WRITE, || {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        rustix::net::send(borrowed, buf, flags)
    })
}

/// `connect()` with the reactor's configured default timeout.
pub fn connect(fd: i32, addr: &rustix::net::SocketAddrAny) -> io::Result<()> {
    let default_ms = global_reactor().config().default_connect_timeout_ms();
    connect_with_timeout(fd, addr, Some(Duration::from_millis(default_ms)))
}

/// `connect()` with an explicit timeout; `None` waits indefinitely,
/// bypassing the reactor's configured default.
///
/// Takes the raw, uncooperative path straight through to the kernel
/// whenever `fd` isn't a tracked socket, or the application has put it in
/// non-blocking mode itself (in which case it already expects to handle
/// `EINPROGRESS`/`EAGAIN` on its own).
pub fn connect_with_timeout(
    fd: i32,
    addr: &rustix::net::SocketAddrAny,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let ctx = FdTable::global().get(fd);
    let raw_path = ctx.as_ref().map_or(true, |c| !c.is_socket() || c.effective_nonblock());

    match rustix::net::connect_any(borrowed, addr) {
        Ok(()) => return Ok(()),
        Err(Errno::INPROGRESS) if !raw_path => {}
        Err(err) => return Err(err.into()),
    }

    global_reactor()
        .wait_for(fd, Direction::WRITE, timeout)
        .map_err(io::Error::from)?;

    match rustix::net::sockopt::socket_error(borrowed)? {
        Ok(()) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

/// `fcntl(fd, F_SETFL, flags)`: records the application's own
/// `O_NONBLOCK` request, but keeps the fd non-blocking at the OS level
/// regardless once the table has forced it there (`sys_nonblock`).
pub fn fcntl_setfl(fd: i32, flags: rustix::io::OFlags) -> io::Result<()> {
    let ctx = FdTable::global().get_or_create(fd);
    ctx.set_user_nonblock(flags.contains(rustix::io::OFlags::NONBLOCK));

    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let actual = if ctx.sys_nonblock() {
        flags | rustix::io::OFlags::NONBLOCK
    } else {
        flags
    };
    rustix::io::fcntl_setfl(borrowed, actual)?;
    Ok(())
}

/// `fcntl(fd, F_GETFL)`: asks the kernel, then overlays the application's
/// own view of `O_NONBLOCK`, which may differ from the kernel's if the
/// runtime forced the fd non-blocking behind the application's back.
pub fn fcntl_getfl(fd: i32) -> io::Result<rustix::io::OFlags> {
    let ctx = FdTable::global().get_or_create(fd);
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut flags = rustix::io::fcntl_getfl(borrowed)?;
    flags.set(rustix::io::OFlags::NONBLOCK, ctx.effective_nonblock());
    Ok(flags)
}

/// Records a per-direction timeout (`SO_RCVTIMEO`/`SO_SNDTIMEO`-style) that
/// hooked reads/writes on `fd` should honor.
pub fn set_timeout(fd: i32, direction: Direction, timeout: Option<Duration>) {
    let ms = timeout.map(|d| d.as_millis() as i64).unwrap_or(-1);
    FdTable::global().get_or_create(fd).set_timeout(direction, ms);
}

pub fn get_timeout(fd: i32, direction: Direction) -> Option<Duration> {
    FdTable::global().get_or_create(fd).timeout(direction)
}
