//! An epoll-backed reactor: a [`Scheduler`] whose idle behavior is
//! `epoll_wait` instead of a condvar park, plus a [`TimerHeap`] drained on
//! every wakeup. Fibers register interest through [`Reactor::add_event`]
//! (or the higher-level [`Reactor::wait_for`]) and hold until their fd is
//! ready or their timeout fires; a self-pipe lets `schedule()` and
//! `stop()` interrupt a worker that is currently parked in `epoll_wait`.

use std::any::Any;
use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rustix::event::epoll;

use crate::config::Config;
use crate::error::Error;
use crate::event::Direction;
use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use crate::timer::{TimerHeap, TimerId};

const WAKEUP_KEY: u64 = u64::MAX;

/// What runs when an armed `(fd, direction)` fires: either the fiber that
/// was `RUNNING` when it called [`Reactor::add_event`] with no explicit
/// callback, or an explicit closure. Exactly one of these backs any
/// armed direction at a time, matching the `FdTask` payload invariant.
enum Payload {
    Fiber(Arc<Fiber>),
    Closure(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
struct FdState {
    armed: Direction,
    payloads: HashMap<Direction, Payload>,
}

struct Shared {
    epoll_fd: OwnedFd,
    wake_read: OwnedFd,
    wake_write: Arc<OwnedFd>,
    fds: Mutex<HashMap<i32, FdState>>,
    /// Count of currently-armed `(fd, direction)` pairs, so the reactor can
    /// tell the scheduler not to let a worker exit while something is still
    /// parked on an fd.
    pending_events: AtomicUsize,
    timers: TimerHeap,
    config: Config,
}

/// A scheduler with an epoll reactor driving its idle loop.
#[derive(Clone)]
pub struct Reactor {
    scheduler: Scheduler,
    shared: Arc<Shared>,
}

fn direction_to_epoll(direction: Direction) -> epoll::EventFlags {
    let mut flags = epoll::EventFlags::empty();
    if direction.contains(Direction::READ) {
        flags |= epoll::EventFlags::IN;
    }
    if direction.contains(Direction::WRITE) {
        flags |= epoll::EventFlags::OUT;
    }
    flags | epoll::EventFlags::ET
}

fn write_wakeup(fd: &OwnedFd) {
    // Best-effort: if the pipe buffer is full a wakeup is already pending.
    let _ = rustix::io::write(fd.as_fd(), &[1u8]);
}

impl Reactor {
    pub fn new(config: Config) -> Arc<Reactor> {
        let epoll_fd = epoll::create(epoll::CreateFlags::CLOEXEC).expect("epoll_create1 failed");
        let (wake_read, wake_write) =
            rustix::pipe::pipe_with(rustix::pipe::PipeFlags::NONBLOCK | rustix::pipe::PipeFlags::CLOEXEC)
                .expect("failed to create reactor wakeup pipe");

        epoll::add(
            epoll_fd.as_fd(),
            wake_read.as_fd(),
            epoll::EventData::new_u64(WAKEUP_KEY),
            epoll::EventFlags::IN,
        )
        .expect("failed to register the wakeup pipe with epoll");

        let timer_config = config.clone();
        let wake_write = Arc::new(wake_write);
        let wake_write_for_timers = wake_write.clone();
        let timers = TimerHeap::new(move || write_wakeup(&wake_write_for_timers));

        let shared = Arc::new(Shared {
            epoll_fd,
            wake_read,
            wake_write,
            fds: Mutex::new(HashMap::new()),
            pending_events: AtomicUsize::new(0),
            timers,
            config: timer_config,
        });

        Arc::new_cyclic(|weak: &Weak<Reactor>| {
            let weak_for_idle = weak.clone();
            let weak_for_notify = weak.clone();
            let weak_for_stop_ready = weak.clone();
            let scheduler = Scheduler::with_idle_and_hooks(
                config,
                None,
                move |sched, idx| {
                    if let Some(reactor) = weak_for_idle.upgrade() {
                        reactor.idle_once(sched, idx);
                    }
                },
                move || {
                    if let Some(reactor) = weak_for_notify.upgrade() {
                        reactor.tickle();
                    }
                },
                move || match weak_for_stop_ready.upgrade() {
                    Some(reactor) => {
                        reactor.shared.pending_events.load(Ordering::SeqCst) == 0
                            && reactor.shared.timers.is_empty()
                    }
                    None => true,
                },
            );
            Reactor { scheduler, shared }
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn schedule(&self, entry: impl FnOnce() + Send + 'static) {
        self.scheduler.schedule(entry);
        self.tickle();
    }

    pub fn schedule_to(&self, thread_index: Option<usize>, entry: impl FnOnce() + Send + 'static) {
        self.scheduler.schedule_to(thread_index, entry);
        self.tickle();
    }

    pub fn stop(&self) {
        self.tickle();
        self.scheduler.stop();
    }

    pub fn is_stopping(&self) -> bool {
        self.scheduler.is_stopping()
    }

    fn tickle(&self) {
        write_wakeup(&self.shared.wake_write);
    }

    /// Arms `direction` on `fd`. If `callback` is `None`, the payload is
    /// the calling fiber (which must be `RUNNING`, i.e. this is called
    /// from inside a scheduled fiber) — it is resumed, not re-entered
    /// directly, once `del_event(fd, direction, true)` fires it. Refuses
    /// (`Error::AlreadyArmed`) to arm a direction that is already armed,
    /// per the "forbid arming the same direction twice" rule in §4.5:
    /// that's a caller bug, not a runtime condition to paper over.
    pub fn add_event(
        &self,
        fd: i32,
        direction: Direction,
        callback: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<(), Error> {
        let payload = match callback {
            Some(cb) => Payload::Closure(cb),
            None => {
                let fiber = Fiber::current();
                assert!(
                    !fiber.is_main(),
                    "add_event with no callback must be called from inside a running fiber"
                );
                Payload::Fiber(fiber)
            }
        };
        self.arm(fd, direction, payload)
    }

    /// Clears `direction` on `fd`. If `trigger` is true and something was
    /// armed, its payload is handed to the scheduler as a new task; if
    /// false, the payload is simply dropped. Returns whether `direction`
    /// was actually armed.
    pub fn del_event(&self, fd: i32, direction: Direction, trigger: bool) -> bool {
        let mut fired = None;
        {
            let mut fds = self.shared.fds.lock().unwrap();
            if let Some(state) = fds.get_mut(&fd) {
                if let Some(payload) = state.payloads.remove(&direction) {
                    state.armed.remove(direction);
                    fired = Some(payload);
                }
                self.rearm_kernel_view(fd, state);
                if state.armed.is_empty() && state.payloads.is_empty() {
                    fds.remove(&fd);
                }
            }
        }
        let found = fired.is_some();
        if found {
            self.shared.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if let (true, Some(payload)) = (trigger, fired) {
            self.run_payload(payload);
        }
        found
    }

    /// `EPOLL_CTL_DEL`s `fd` outright and triggers every direction that
    /// was armed on it (e.g. because the application is closing the fd).
    /// Returns whether `fd` was tracked at all.
    pub fn del_and_trigger_all(&self, fd: i32) -> bool {
        let mut payloads = Vec::new();
        let existed;
        {
            let mut fds = self.shared.fds.lock().unwrap();
            existed = fds.contains_key(&fd);
            if let Some(state) = fds.remove(&fd) {
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                let _ = epoll::delete(self.shared.epoll_fd.as_fd(), borrowed);
                payloads.extend(state.payloads.into_values());
            }
        }
        if !payloads.is_empty() {
            self.shared
                .pending_events
                .fetch_sub(payloads.len(), Ordering::SeqCst);
        }
        for payload in payloads {
            self.run_payload(payload);
        }
        existed
    }

    /// Schedules `callback` to run `delay_ms` from now; if `repeat`, it
    /// keeps rearming itself at that interval.
    pub fn add_timer(
        &self,
        delay_ms: u64,
        repeat: bool,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> TimerId {
        self.shared.timers.add_timer(delay_ms, repeat, callback)
    }

    /// As [`add_timer`](Reactor::add_timer), but `callback` only runs if
    /// `witness` still upgrades at the deadline.
    pub fn add_condition_timer(
        &self,
        delay_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        witness: Weak<dyn Any + Send + Sync>,
    ) -> TimerId {
        self.shared.timers.add_condition_timer(delay_ms, callback, witness)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.shared.timers.cancel(id)
    }

    /// Parks the calling fiber until `fd` is ready for `direction`, or
    /// (if given) `timeout` elapses first. A convenience composed from
    /// [`add_event`](Reactor::add_event)/[`del_event`](Reactor::del_event)
    /// and a one-shot timer — the same composition `do_io` in the hook
    /// layer would otherwise repeat at every call site.
    pub fn wait_for(
        &self,
        fd: i32,
        direction: Direction,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let fiber = Fiber::current();
        assert!(
            !fiber.is_main(),
            "wait_for() must be called from inside a scheduled fiber"
        );

        self.add_event(fd, direction, None)?;

        let timed_out = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let timer_id = timeout.map(|dur| {
            let reactor = self.clone();
            let timed_out = timed_out.clone();
            self.add_timer(dur.as_millis() as u64, false, move || {
                // `del_event` only reports `true` if this call is the one
                // that actually removed the payload — i.e. the fd hadn't
                // already become ready first. That race is what decides
                // whether this resume counts as a timeout.
                if reactor.del_event(fd, direction, true) {
                    timed_out.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            })
        });

        Fiber::yield_to_hold();

        if let Some(id) = timer_id {
            self.cancel_timer(id);
        }

        if timed_out.load(std::sync::atomic::Ordering::SeqCst) {
            Err(Error::Timeout { fd, direction })
        } else {
            Ok(())
        }
    }

    /// Sleeps the calling fiber for `ms` milliseconds without blocking its
    /// worker thread.
    pub fn sleep_ms(&self, ms: u64) {
        let fiber = Fiber::current();
        assert!(!fiber.is_main(), "sleep_ms() must run inside a fiber");
        let scheduler = self.scheduler.clone();
        let fiber_for_timer = fiber.clone();
        self.shared.timers.add_timer(ms, false, move || {
            scheduler.schedule_fiber(fiber_for_timer.clone(), None);
        });
        Fiber::yield_to_hold();
    }

    /// Hands a fired payload to the scheduler. Deliberately does not flip
    /// the fiber's state to `Ready` first: the fiber that armed this event
    /// may not have physically reached `yield_to_hold` yet (it can still be
    /// `RUNNING` on another worker), and forcing `Ready` here would race
    /// that transition. The scheduler's own dequeue scan defers a `RUNNING`
    /// fiber until it actually holds.
    fn run_payload(&self, payload: Payload) {
        match payload {
            Payload::Fiber(fiber) => {
                self.scheduler.schedule_fiber(fiber, None);
            }
            Payload::Closure(closure) => {
                self.scheduler.schedule(move || closure());
            }
        }
    }

    fn arm(&self, fd: i32, direction: Direction, payload: Payload) -> Result<(), Error> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = self.shared.fds.lock().unwrap();
        let state = fds.entry(fd).or_default();
        if state.payloads.contains_key(&direction) {
            return Err(Error::AlreadyArmed { fd, direction });
        }
        let was_empty = state.armed.is_empty();
        state.armed |= direction;
        state.payloads.insert(direction, payload);

        let flags = direction_to_epoll(state.armed);
        let result = if was_empty {
            epoll::add(
                self.shared.epoll_fd.as_fd(),
                borrowed,
                epoll::EventData::new_u64(fd as u64),
                flags,
            )
        } else {
            epoll::modify(
                self.shared.epoll_fd.as_fd(),
                borrowed,
                epoll::EventData::new_u64(fd as u64),
                flags,
            )
        };
        match result {
            Ok(()) => {
                self.shared.pending_events.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(source) => {
                state.payloads.remove(&direction);
                state.armed.remove(direction);
                if state.armed.is_empty() && state.payloads.is_empty() {
                    fds.remove(&fd);
                }
                Err(Error::EpollFailure { fd, source })
            }
        }
    }

    /// Pushes `state.armed`'s current bitmask down to the kernel after a
    /// removal: `EPOLL_CTL_MOD` with whatever remains armed, or
    /// `EPOLL_CTL_DEL` if nothing is left.
    fn rearm_kernel_view(&self, fd: i32, state: &FdState) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if state.armed.is_empty() {
            let _ = epoll::delete(self.shared.epoll_fd.as_fd(), borrowed);
        } else {
            let flags = direction_to_epoll(state.armed);
            let _ = epoll::modify(
                self.shared.epoll_fd.as_fd(),
                borrowed,
                epoll::EventData::new_u64(fd as u64),
                flags,
            );
        }
    }

    /// Fires whichever directions in `ready` are currently armed on `fd`,
    /// via the same `del_event(.., trigger = true)` path a timeout or an
    /// explicit caller would use — readiness is just another trigger
    /// source, never a direct resume.
    fn wake_fd(&self, fd: i32, ready: Direction) {
        for direction in [Direction::READ, Direction::WRITE] {
            if ready.contains(direction) {
                self.del_event(fd, direction, true);
            }
        }
    }

    fn drain_wakeup_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            match rustix::io::read(self.shared.wake_read.as_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    fn idle_once(&self, _scheduler: &Scheduler, _worker_index: usize) {
        let ceiling = self.shared.config.epoll_wait_ceiling_ms();
        let wait_ms = self
            .shared
            .timers
            .next_deadline_ms()
            .unwrap_or(ceiling)
            .min(ceiling);

        let mut events = epoll::EventVec::with_capacity(64);
        if let Err(err) = epoll::wait(
            self.shared.epoll_fd.as_fd(),
            &mut events,
            Some(Duration::from_millis(wait_ms)),
        ) {
            if err != rustix::io::Errno::INTR {
                log::warn!("epoll_wait failed: {err}");
            }
        }

        for event in &events {
            let key = event.data.u64();
            if key == WAKEUP_KEY {
                self.drain_wakeup_pipe();
                continue;
            }
            let fd = key as i32;
            let mut ready = Direction::empty();
            if event
                .flags
                .intersects(epoll::EventFlags::IN | epoll::EventFlags::HUP | epoll::EventFlags::ERR)
            {
                ready |= Direction::READ;
            }
            if event
                .flags
                .intersects(epoll::EventFlags::OUT | epoll::EventFlags::HUP | epoll::EventFlags::ERR)
            {
                ready |= Direction::WRITE;
            }
            self.wake_fd(fd, ready);
        }

        for callback in self.shared.timers.collect_expired() {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn wait_for_wakes_on_readability() {
        let reactor = Reactor::new(Config::new().with_worker_count(1));
        let (read_fd, write_fd) = rustix::pipe::pipe().unwrap();
        let read_raw = std::os::fd::AsRawFd::as_raw_fd(&read_fd);

        let (tx, rx) = mpsc::channel();
        let reactor2 = reactor.clone();
        reactor.schedule(move || {
            let result = reactor2.wait_for(read_raw, Direction::READ, Some(Duration::from_secs(2)));
            tx.send(result.is_ok()).unwrap();
        });

        std::thread::sleep(Duration::from_millis(20));
        rustix::io::write(write_fd.as_fd(), b"x").unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        reactor.stop();
    }

    #[test]
    fn wait_for_times_out_without_activity() {
        let reactor = Reactor::new(Config::new().with_worker_count(1));
        let (read_fd, _write_fd) = rustix::pipe::pipe().unwrap();
        let read_raw = std::os::fd::AsRawFd::as_raw_fd(&read_fd);

        let (tx, rx) = mpsc::channel();
        let reactor2 = reactor.clone();
        reactor.schedule(move || {
            let result = reactor2.wait_for(read_raw, Direction::READ, Some(Duration::from_millis(30)));
            tx.send(result.is_err()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        // No fd leak: once the timeout fires and the waiter is woken, this
        // fd's entry should be gone entirely rather than lingering with an
        // empty armed set.
        std::thread::sleep(Duration::from_millis(20));
        assert!(!reactor.shared.fds.lock().unwrap().contains_key(&read_raw));
        reactor.stop();
    }

    /// `add_event`/`del_event` twice on the same `(fd, direction)` without
    /// an intervening resolution is a programmer error, not silently
    /// ignored.
    #[test]
    fn arming_the_same_direction_twice_is_rejected() {
        let reactor = Reactor::new(Config::new().with_worker_count(1));
        let (read_fd, _write_fd) = rustix::pipe::pipe().unwrap();
        let read_raw = std::os::fd::AsRawFd::as_raw_fd(&read_fd);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        reactor
            .add_event(
                read_raw,
                Direction::READ,
                Some(Box::new(move || {
                    fired2.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        let err = reactor
            .add_event(read_raw, Direction::READ, Some(Box::new(|| {})))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyArmed { fd, direction } if fd == read_raw && direction == Direction::READ));
        reactor.stop();
    }

    /// `add_event(fd, R); del_event(fd, R, false)` should leave nothing
    /// behind: no kernel registration, no fd-table entry — indistinguishable
    /// from the fd never having been armed (the reactor idempotence
    /// property from the testable-properties list).
    #[test]
    fn del_event_without_trigger_leaves_no_trace() {
        let reactor = Reactor::new(Config::new().with_worker_count(1));
        let (read_fd, _write_fd) = rustix::pipe::pipe().unwrap();
        let read_raw = std::os::fd::AsRawFd::as_raw_fd(&read_fd);

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        reactor
            .add_event(
                read_raw,
                Direction::READ,
                Some(Box::new(move || ran2.store(true, Ordering::SeqCst))),
            )
            .unwrap();
        assert!(reactor.del_event(read_raw, Direction::READ, false));
        assert!(!reactor.shared.fds.lock().unwrap().contains_key(&read_raw));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!ran.load(Ordering::SeqCst));
        reactor.stop();
    }

    /// `stop()` must not tear a worker down while a fiber is still parked
    /// on a pending fd event: the worker should keep draining until the
    /// event resolves, not abandon it the instant the queue goes empty.
    #[test]
    fn stop_waits_out_a_pending_wait_for() {
        let reactor = Reactor::new(Config::new().with_worker_count(1));
        let (read_fd, write_fd) = rustix::pipe::pipe().unwrap();
        let read_raw = std::os::fd::AsRawFd::as_raw_fd(&read_fd);

        let (tx, rx) = mpsc::channel();
        let reactor2 = reactor.clone();
        reactor.schedule(move || {
            let result = reactor2.wait_for(read_raw, Direction::READ, None);
            tx.send(result.is_ok()).unwrap();
        });
        // Let the fiber reach its wait before we start stopping.
        std::thread::sleep(Duration::from_millis(20));

        let reactor3 = reactor.clone();
        let stopped = std::thread::spawn(move || reactor3.stop());

        // `stop()` must not have returned yet: nothing has made the fd
        // ready, so the worker should still be parked draining it.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!stopped.is_finished());

        rustix::io::write(write_fd.as_fd(), b"x").unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        stopped.join().unwrap();
    }

    /// A plain closure-backed timer (no fiber involved) fires on its own
    /// schedule through the reactor's idle loop.
    #[test]
    fn add_timer_runs_a_closure_on_the_reactor() {
        let reactor = Reactor::new(Config::new().with_worker_count(1));
        let (tx, rx) = mpsc::channel();
        reactor.add_timer(20, false, move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        reactor.stop();
    }
}
