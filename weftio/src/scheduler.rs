//! A cooperative, multi-threaded fiber scheduler: a shared ready queue
//! drained by a pool of [`ThreadWorker`]s, each running fibers to
//! completion or until they hold.
//!
//! [`Reactor`](crate::reactor::Reactor) builds on this by swapping in its
//! own idle callback (`epoll_wait` instead of a plain condvar park), so an
//! I/O-aware scheduler is just this one with a different idle behavior.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::fiber::{Fiber, FiberPool, State};
use crate::worker::ThreadWorker;

struct QueueItem {
    fiber: Arc<Fiber>,
    thread_hint: Option<usize>,
}

type IdleFn = dyn Fn(&Scheduler, usize) + Send + Sync;
type NotifyFn = dyn Fn() + Send + Sync;
type StopReadyFn = dyn Fn() -> bool + Send + Sync;

struct Shared {
    name: String,
    queue: Mutex<VecDeque<QueueItem>>,
    cond: Condvar,
    stopping: AtomicBool,
    stack_size: usize,
    idle: Box<IdleFn>,
    /// Extra wakeup hook run alongside `cond.notify_all()`, e.g. so
    /// [`Reactor`](crate::reactor::Reactor) can also tickle its wakeup pipe
    /// for workers parked in `epoll_wait` rather than on `cond`.
    extra_notify: Box<NotifyFn>,
    /// Extra condition a scheduler built on top of this one (the reactor)
    /// can fold into the worker exit check, alongside "stopping and the
    /// ready queue is empty".
    extra_stop_ready: Box<StopReadyFn>,
    fiber_pool: Option<Arc<FiberPool>>,
}

/// A handle to a running fiber scheduler. Cloning shares the same
/// underlying queue and worker pool.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<ThreadWorker>>>,
}

impl Scheduler {
    /// Starts a scheduler with `config.worker_count()` worker threads and
    /// the default idle behavior (park on a condvar until woken by new
    /// work or `stop()`).
    pub fn new(config: Config) -> Self {
        Self::with_idle(config, None, default_idle)
    }

    /// As [`new`](Scheduler::new), but closure-task fibers are drawn from a
    /// [`FiberPool`] and returned to it once they finish, instead of each
    /// task allocating and discarding its own stack. Plain `new` always
    /// allocates fresh; this is an opt-in enhancement, not a change to the
    /// default.
    pub fn with_fiber_pool(config: Config) -> Self {
        let pool = Arc::new(FiberPool::new(config.default_stack_size()));
        Self::with_idle(config, Some(pool), default_idle)
    }

    /// As [`new`](Scheduler::new), but with a custom idle callback invoked
    /// whenever a worker finds the ready queue empty. Used by
    /// [`Reactor`](crate::reactor::Reactor) to park in `epoll_wait`
    /// instead.
    pub(crate) fn with_idle(
        config: Config,
        fiber_pool: Option<Arc<FiberPool>>,
        idle: impl Fn(&Scheduler, usize) + Send + Sync + 'static,
    ) -> Self {
        Self::with_idle_and_hooks(config, fiber_pool, idle, || {}, || true)
    }

    /// As [`with_idle`](Scheduler::with_idle), additionally letting a
    /// caller plug into the wakeup and exit-check paths. Used by
    /// [`Reactor`](crate::reactor::Reactor), whose workers park in
    /// `epoll_wait` rather than on `cond` and whose idle loop tracks
    /// pending fd events and timers that must drain before a worker exits.
    pub(crate) fn with_idle_and_hooks(
        config: Config,
        fiber_pool: Option<Arc<FiberPool>>,
        idle: impl Fn(&Scheduler, usize) + Send + Sync + 'static,
        extra_notify: impl Fn() + Send + Sync + 'static,
        extra_stop_ready: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        let shared = Arc::new(Shared {
            name: config.scheduler_name().to_string(),
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stopping: AtomicBool::new(false),
            stack_size: config.default_stack_size(),
            idle: Box::new(idle),
            extra_notify: Box::new(extra_notify),
            extra_stop_ready: Box::new(extra_stop_ready),
            fiber_pool,
        });
        let scheduler = Scheduler {
            shared,
            workers: Arc::new(Mutex::new(Vec::new())),
        };

        let mut workers = Vec::with_capacity(config.worker_count());
        for index in 0..config.worker_count() {
            let name = format!("{}-{}", scheduler.shared.name, index);
            let handle = scheduler.clone();
            workers.push(ThreadWorker::spawn(name, move || handle.run(index)));
        }
        *scheduler.workers.lock().unwrap() = workers;
        scheduler
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues `entry` to run on any worker, wrapped in a freshly allocated
    /// fiber using this scheduler's configured stack size.
    pub fn schedule(&self, entry: impl FnOnce() + Send + 'static) {
        self.schedule_to(None, entry)
    }

    /// As [`schedule`](Scheduler::schedule), but pinned to the worker at
    /// `thread_index` (indices are `0..config.worker_count()`).
    pub fn schedule_to(&self, thread_index: Option<usize>, entry: impl FnOnce() + Send + 'static) {
        let fiber = match &self.shared.fiber_pool {
            Some(pool) => pool.acquire(entry),
            None => Fiber::new(self.shared.stack_size, entry),
        };
        self.schedule_fiber(fiber, thread_index);
    }

    /// Queues an already-constructed fiber (e.g. one a reactor is waking
    /// back up from `HOLD`).
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread_hint: Option<usize>) {
        let was_empty;
        {
            let mut queue = self.shared.queue.lock().unwrap();
            was_empty = queue.is_empty();
            queue.push_back(QueueItem { fiber, thread_hint });
        }
        if was_empty {
            self.notify_all();
        }
    }

    /// Queues a batch of callbacks in one locked section, only waking
    /// workers once.
    pub fn schedule_batch<I>(&self, entries: I)
    where
        I: IntoIterator<Item = Box<dyn FnOnce() + Send + 'static>>,
    {
        let mut queue = self.shared.queue.lock().unwrap();
        let was_empty = queue.is_empty();
        for entry in entries {
            let fiber = match &self.shared.fiber_pool {
                Some(pool) => pool.acquire(move || entry()),
                None => Fiber::new(self.shared.stack_size, move || entry()),
            };
            queue.push_back(QueueItem {
                fiber,
                thread_hint: None,
            });
        }
        drop(queue);
        if was_empty {
            self.notify_all();
        }
    }

    /// Signals all workers to stop once the ready queue drains, and waits
    /// for them to exit.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            worker.join();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn notify(&self) {
        self.notify_all();
    }

    fn notify_all(&self) {
        self.shared.cond.notify_all();
        (self.shared.extra_notify)();
    }

    pub(crate) fn cond_and_queue(&self) -> (&Condvar, &Mutex<VecDeque<QueueItem>>) {
        (&self.shared.cond, &self.shared.queue)
    }

    fn queue_is_empty(&self) -> bool {
        self.shared.queue.lock().unwrap().is_empty()
    }

    /// Scans the queue for a task this worker can run right now, leaving
    /// anything it skips over in place rather than dropping it: a task
    /// pinned to another worker, or one whose fiber is still physically
    /// `RUNNING` elsewhere (a wakeup raced its own `yield_to_hold`/
    /// `yield_to_ready`), is retried on a later pass instead of being
    /// silently discarded. Returns the task alongside whether some other
    /// worker should be woken to go look at what this one skipped.
    fn next_task(&self, worker_index: usize) -> (Option<Arc<Fiber>>, bool) {
        let mut queue = self.shared.queue.lock().unwrap();
        let mut notify_others = false;
        let mut found = None;
        for (i, item) in queue.iter().enumerate() {
            if item.thread_hint.is_some() && item.thread_hint != Some(worker_index) {
                notify_others = true;
                continue;
            }
            if item.fiber.state() == State::Running {
                continue;
            }
            found = Some(i);
            break;
        }
        let fiber = found.map(|i| queue.remove(i).unwrap().fiber);
        (fiber, notify_others)
    }

    fn run(&self, worker_index: usize) {
        loop {
            if self.is_stopping() && self.queue_is_empty() && (self.shared.extra_stop_ready)() {
                return;
            }
            let (task, notify_others) = self.next_task(worker_index);
            if notify_others {
                self.notify_all();
            }
            match task {
                Some(fiber) => match fiber.state() {
                    State::Terminated | State::Except => {
                        if let Some(pool) = &self.shared.fiber_pool {
                            pool.release(fiber);
                        }
                    }
                    State::Running => unreachable!("next_task must not hand back a running fiber"),
                    State::Init | State::Ready | State::Hold => {
                        fiber.enter();
                        match fiber.state() {
                            State::Ready => self.schedule_fiber(fiber, None),
                            State::Terminated | State::Except => {
                                if let Some(pool) = &self.shared.fiber_pool {
                                    pool.release(fiber);
                                }
                            }
                            State::Hold => {}
                            State::Running | State::Init => unreachable!(
                                "fiber left enter() in state {:?}",
                                fiber.state()
                            ),
                        }
                    }
                },
                None => (self.shared.idle)(self, worker_index),
            }
        }
    }
}

/// Parks until new work arrives, `stop()` is called, or a short ceiling
/// elapses — the ceiling exists purely so a scheduler with no reactor
/// attached still notices `stop()` promptly.
fn default_idle(scheduler: &Scheduler, _worker_index: usize) {
    let queue = scheduler.shared.queue.lock().unwrap();
    if !queue.is_empty() || scheduler.is_stopping() {
        return;
    }
    let _ = scheduler
        .shared
        .cond
        .wait_timeout(queue, Duration::from_millis(50))
        .unwrap();
}
