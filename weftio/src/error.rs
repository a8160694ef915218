use std::io;

use crate::event::Direction;

/// Errors surfaced by the scheduler, reactor, and hook layer.
///
/// The underlying `Errno` is carried rather than flattened into a string,
/// so callers that care can match on it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fd {fd} is not tracked by the fd table")]
    BadFd { fd: i32 },

    #[error("fd {fd} timed out waiting for {direction}")]
    Timeout { fd: i32, direction: Direction },

    #[error("epoll_ctl on fd {fd} failed: {source}")]
    EpollFailure { fd: i32, source: rustix::io::Errno },

    #[error("fd {fd} is already armed for {direction}")]
    AlreadyArmed { fd: i32, direction: Direction },

    #[error("fiber {id} terminated with an unhandled panic")]
    FiberExcept { id: u64 },

    #[error("the scheduler has been stopped")]
    SchedulerStopped,
}

impl Error {
    /// The `errno` a hooked libc-shaped function should report for this
    /// error, matching what the syscall it replaces would have set.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::BadFd { .. } => libc::EBADF,
            Error::Timeout { .. } => libc::ETIMEDOUT,
            Error::EpollFailure { source, .. } => source.raw_os_error(),
            Error::AlreadyArmed { .. } => libc::EEXIST,
            Error::FiberExcept { .. } => libc::ECANCELED,
            Error::SchedulerStopped => libc::ESHUTDOWN,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        io::Error::from_raw_os_error(err.to_errno())
    }
}
