use weftio_fiber::DEFAULT_STACK_SIZE;

/// Tunables for a [`crate::scheduler::Scheduler`] / [`crate::reactor::Reactor`].
///
/// Constructed with [`Config::default`] and adjusted with the `with_*`
/// builder methods, in the style of `wasmtime::Config`.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) default_stack_size: usize,
    pub(crate) default_connect_timeout_ms: u64,
    pub(crate) epoll_wait_ceiling_ms: u64,
    pub(crate) worker_count: usize,
    pub(crate) scheduler_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_stack_size: DEFAULT_STACK_SIZE,
            default_connect_timeout_ms: 5_000,
            epoll_wait_ceiling_ms: 5_000,
            worker_count: 1,
            scheduler_name: "weftio".to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack size new fibers get unless a call site requests otherwise.
    pub fn with_default_stack_size(mut self, bytes: usize) -> Self {
        self.default_stack_size = bytes;
        self
    }

    /// Timeout applied by the bare `connect()` hook (`connect_with_timeout`
    /// with an explicit timeout bypasses this).
    pub fn with_default_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.default_connect_timeout_ms = ms;
        self
    }

    /// Upper bound on how long a single `epoll_wait` call may block, so the
    /// reactor loop still wakes periodically even with no fd or timer
    /// activity pending.
    pub fn with_epoll_wait_ceiling_ms(mut self, ms: u64) -> Self {
        self.epoll_wait_ceiling_ms = ms;
        self
    }

    /// Number of `ThreadWorker`s the scheduler spawns in addition to its
    /// caller thread. Must be at least 1.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        assert!(count >= 1, "a scheduler needs at least one worker thread");
        self.worker_count = count;
        self
    }

    /// Base name used for worker thread names (`"{name}-{i}"`).
    pub fn with_scheduler_name(mut self, name: impl Into<String>) -> Self {
        self.scheduler_name = name.into();
        self
    }

    pub fn default_stack_size(&self) -> usize {
        self.default_stack_size
    }

    pub fn default_connect_timeout_ms(&self) -> u64 {
        self.default_connect_timeout_ms
    }

    pub fn epoll_wait_ceiling_ms(&self) -> u64 {
        self.epoll_wait_ceiling_ms
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn scheduler_name(&self) -> &str {
        &self.scheduler_name
    }
}
