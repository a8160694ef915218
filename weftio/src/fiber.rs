//! The `INIT/READY/RUNNING/HOLD/TERMINATED/EXCEPT` fiber state machine,
//! layered on top of the bare context switch in `weftio-fiber`.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use weftio_fiber::{RawFiber, Stack};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A fiber's lifecycle state: `INIT -> READY -> RUNNING -> {HOLD, TERMINATED,
/// EXCEPT}`, with `HOLD` looping back to `READY` once whatever it's waiting
/// on resolves. Enforced here with `assert!`s rather than silently coerced,
/// since a violated transition means a scheduling bug upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Init = 0,
    Ready = 1,
    Running = 2,
    Hold = 3,
    Terminated = 4,
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Running,
            3 => State::Hold,
            4 => State::Terminated,
            5 => State::Except,
            _ => unreachable!("invalid fiber state byte"),
        }
    }
}

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// A user-space stackful task, wrapping a [`RawFiber`] with an id and a
/// lifecycle state. The thread's own native stack is represented too (see
/// [`Fiber::current`]), as a `Fiber` with no underlying `RawFiber`.
pub struct Fiber {
    id: u64,
    raw: Option<RawFiber>,
    state: AtomicU8,
}

// Safety: a `Fiber` is only ever transitioned out of `Running` by the same
// OS thread that is running it (or, for `Init`/`Ready`/`Hold`, read/written
// while that invariant guarantees no concurrent runner). The `RawFiber`
// inside is likewise only ever resumed by one thread at a time; ownership
// of the `Arc<Fiber>` handle is what actually moves between threads.
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Allocates a new fiber with its own guard-paged stack, primed to run
    /// `entry` on first [`enter`](Fiber::enter).
    pub fn new(stack_size: usize, entry: impl FnOnce() + Send + 'static) -> Arc<Fiber> {
        let stack = Stack::new(stack_size).expect("failed to allocate a fiber stack");
        let raw = RawFiber::new(stack);
        let fiber = Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            raw: Some(raw),
            state: AtomicU8::new(State::Init as u8),
        });
        Self::prime(&fiber, entry);
        fiber
    }

    /// Re-primes a fiber that has finished (`Terminated`/`Except`) or was
    /// never run (`Init`) so it can be entered again, reusing its stack
    /// allocation. Panics if the fiber might still be running.
    pub fn reuse(self: &Arc<Self>, entry: impl FnOnce() + Send + 'static) {
        let state = self.state();
        assert!(
            matches!(state, State::Init | State::Terminated | State::Except),
            "cannot reuse a fiber in state {state:?}"
        );
        assert!(self.raw.is_some(), "the main fiber has no stack to reuse");
        Self::prime(self, entry);
        self.set_state(State::Init);
    }

    fn prime(fiber: &Arc<Fiber>, entry: impl FnOnce() + Send + 'static) {
        let weak = Arc::downgrade(fiber);
        let wrapped = move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
            let Some(fiber) = weak.upgrade() else {
                // The handle was dropped while we were the only thing
                // keeping the fiber alive besides the scheduler's queue;
                // nothing left to report the outcome to.
                return;
            };
            match result {
                Ok(()) => fiber.set_state(State::Terminated),
                Err(payload) => {
                    let message = panic_message(&payload);
                    let backtrace = Backtrace::force_capture();
                    log::error!(
                        "fiber {} panicked: {message}\n{backtrace}",
                        fiber.id
                    );
                    fiber.set_state(State::Except);
                }
            }
        };
        fiber
            .raw
            .as_ref()
            .expect("the main fiber cannot be primed")
            .set_entry(Box::new(wrapped));
    }

    /// This thread's fiber, creating a thread-local stand-in for its
    /// native stack on first use if nothing has entered a fiber here yet.
    pub fn current() -> Arc<Fiber> {
        CURRENT_FIBER.with(|c| {
            if let Some(fiber) = c.borrow().clone() {
                return fiber;
            }
            let main = Arc::new(Fiber {
                id: 0,
                raw: None,
                state: AtomicU8::new(State::Running as u8),
            });
            *c.borrow_mut() = Some(main.clone());
            main
        })
    }

    /// The id of the fiber running on this thread, or `0` if this thread
    /// has never entered a fiber (without forcing the lazy main-fiber
    /// creation that [`current`](Fiber::current) performs).
    pub fn current_id() -> u64 {
        CURRENT_FIBER.with(|c| c.borrow().as_ref().map_or(0, |f| f.id))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_main(&self) -> bool {
        self.raw.is_none()
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Switches the calling thread onto this fiber; returns once it holds,
    /// terminates, or excepts. Updates the thread-local "current fiber" for
    /// the duration of the call.
    pub fn enter(self: &Arc<Self>) {
        assert_ne!(
            self.state(),
            State::Running,
            "fiber {} entered while already running",
            self.id
        );
        let raw = self
            .raw
            .as_ref()
            .expect("the main fiber represents the thread's own stack and cannot be entered");

        let previous = CURRENT_FIBER.with(|c| c.borrow_mut().replace(self.clone()));
        self.set_state(State::Running);

        // Safety: `self` was primed by `new`/`reuse` and is not already
        // running, per the assertion above.
        unsafe { raw.resume() };

        CURRENT_FIBER.with(|c| *c.borrow_mut() = previous);
    }

    /// Yields control back to whoever called [`enter`](Fiber::enter),
    /// moving this fiber to `HOLD` (e.g. parked on an I/O wait).
    pub fn yield_to_hold() {
        let current = Fiber::current();
        assert_eq!(current.state(), State::Running);
        current.set_state(State::Hold);
        weftio_fiber::suspend();
    }

    /// Yields control back to whoever called [`enter`](Fiber::enter),
    /// moving this fiber to `READY` (still runnable, cooperatively
    /// rescheduled).
    pub fn yield_to_ready() {
        let current = Fiber::current();
        assert_eq!(current.state(), State::Running);
        current.set_state(State::Ready);
        weftio_fiber::suspend();
    }

    /// Marks a held fiber runnable again (e.g. its I/O wait fired), without
    /// resuming it itself — the scheduler picks it back up.
    ///
    /// Tolerates `RUNNING` as well as `HOLD`: a wakeup can be triggered
    /// before the fiber that armed it has physically reached its own
    /// `yield_to_hold`/`yield_to_ready`, so asserting `HOLD` here would
    /// crash the waking worker on a legitimate race rather than letting the
    /// scheduler's dequeue scan defer the fiber until it actually holds.
    pub fn mark_ready(self: &Arc<Self>) {
        let state = self.state();
        assert!(
            matches!(state, State::Hold | State::Running),
            "mark_ready on a fiber in state {state:?}"
        );
        if state == State::Hold {
            self.set_state(State::Ready);
        }
    }
}

/// A small pool of finished fibers kept around so a scheduler's
/// closure-task path can [`reuse`](Fiber::reuse) an existing stack instead
/// of `mmap`-ing a fresh one per task. Opt-in: building one fiber per
/// callback task remains the default (see `Scheduler::new` vs.
/// `Scheduler::with_fiber_pool`).
pub struct FiberPool {
    stack_size: usize,
    idle: std::sync::Mutex<Vec<Arc<Fiber>>>,
}

impl FiberPool {
    pub fn new(stack_size: usize) -> Self {
        Self {
            stack_size,
            idle: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Hands back a fiber primed to run `entry`, popping one off the idle
    /// list if one is free or allocating a new stack otherwise.
    pub fn acquire(&self, entry: impl FnOnce() + Send + 'static) -> Arc<Fiber> {
        if let Some(fiber) = self.idle.lock().unwrap().pop() {
            fiber.reuse(entry);
            fiber
        } else {
            Fiber::new(self.stack_size, entry)
        }
    }

    /// Returns a fiber to the pool once its task has finished, so a later
    /// [`acquire`](FiberPool::acquire) can reuse its stack. Silently drops
    /// fibers that aren't in a terminal state (a caller bug, not a panic
    /// here, since the pool has no way to know why).
    pub fn release(&self, fiber: Arc<Fiber>) {
        if matches!(fiber.state(), State::Terminated | State::Except) {
            self.idle.lock().unwrap().push(fiber);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("is_main", &self.is_main())
            .finish()
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
