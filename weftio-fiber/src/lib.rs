//! Machine-context primitive for `weftio`'s stackful fibers.
//!
//! This crate knows nothing about scheduling, fiber ids, or the
//! `INIT/READY/RUNNING/...` state machine — that lives in `weftio::fiber`.
//! All it provides is: an owned, guard-paged stack, and a way to switch
//! the CPU's register file and stack pointer onto that stack and back.
//!
//! The switch itself is a few lines of hand-written x86_64 assembly
//! (`src/arch/x86_64.s`, assembled by `build.rs` via `cc`), rather than
//! relying on the deprecated, slow `ucontext_t` family of syscalls.

mod arch;
mod stack;

pub use stack::{StackError, DEFAULT_STACK_SIZE};
pub use stack::Stack;

use std::cell::Cell;
use std::ptr;

thread_local! {
    // Where `suspend()` should save the currently-running fiber's stack
    // pointer: the `sp` slot inside that fiber's own `RawFiber`.
    static CURRENT: Cell<*mut *mut u8> = const { Cell::new(ptr::null_mut()) };
    // Where `suspend()` should switch back to: a slot living on the stack
    // frame of whoever called `resume()`.
    static RETURN: Cell<*mut *mut u8> = const { Cell::new(ptr::null_mut()) };
}

/// A bare stackful coroutine: a stack plus a saved stack pointer.
///
/// A `RawFiber` starts out unprimed; [`RawFiber::set_entry`] must be
/// called (once per "life", i.e. once initially and once per `reuse`)
/// before the first [`RawFiber::resume`].
pub struct RawFiber {
    sp: Cell<*mut u8>,
    stack: Stack,
}

// Safety: a `RawFiber` is only ever entered from one OS thread at a time,
// and ownership of its stack moves with it.
unsafe impl Send for RawFiber {}

impl RawFiber {
    pub fn new(stack: Stack) -> Self {
        Self {
            sp: Cell::new(ptr::null_mut()),
            stack,
        }
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Primes this fiber's stack to invoke `entry` the next time it is
    /// [`resume`]d. `entry` must not unwind across its own top level —
    /// any panic must be caught inside `entry` itself, since unwinding
    /// across the raw context switch boundary is undefined behavior.
    pub fn set_entry(&self, entry: Box<dyn FnOnce() + 'static>) {
        let boxed: Box<Box<dyn FnOnce()>> = Box::new(entry);
        let arg = Box::into_raw(boxed).cast::<u8>();

        // Safety: `self.stack.top()` bounds a stack we own exclusively.
        let sp = unsafe { arch::prepare_stack(self.stack.top(), arg) };
        self.sp.set(sp);
    }

    /// Switches the calling context onto this fiber. Returns once the
    /// fiber calls [`suspend`] or its entry closure returns.
    ///
    /// # Safety
    /// - `set_entry` must have been called since this `RawFiber` was
    ///   constructed or since it last ran to completion.
    /// - This fiber must not already be running (directly, or via a
    ///   cycle of resumes).
    pub unsafe fn resume(&self) {
        let mut caller_sp: *mut u8 = ptr::null_mut();

        let prev_current = CURRENT.with(|c| c.replace(self.sp.as_ptr()));
        let prev_return = RETURN.with(|c| c.replace(ptr::addr_of_mut!(caller_sp)));

        // Safety: `self.sp` holds a pointer prepared by `prepare_stack`
        // or previously saved here by a matching `suspend`/return.
        unsafe {
            arch::switch(ptr::addr_of_mut!(caller_sp), self.sp.get());
        }

        CURRENT.with(|c| c.set(prev_current));
        RETURN.with(|c| c.set(prev_return));
    }
}

/// Switches out of the currently-running fiber back to whoever called
/// [`RawFiber::resume`]. Must only be called from inside a fiber's entry
/// closure (directly or transitively on the same OS thread).
///
/// # Panics
/// Panics if called when no fiber is running on the current thread.
pub fn suspend() {
    let cur = CURRENT.with(Cell::get);
    let ret = RETURN.with(Cell::get);
    assert!(
        !cur.is_null() && !ret.is_null(),
        "weftio_fiber::suspend() called outside a running fiber"
    );

    // Safety: `cur`/`ret` were set up by the enclosing `resume()` and
    // remain valid for the duration of this call (they point at stack
    // slots that are still on the call stack, by construction).
    unsafe {
        let load_sp = *ret;
        arch::switch(cur, load_sp);
    }
}

/// Landing pad invoked (via `weftio_fiber_trampoline` in the arch stub)
/// the first time a fiber is resumed.
#[no_mangle]
extern "C" fn weftio_fiber_start(arg: *mut u8) -> ! {
    // Safety: `arg` was produced by `Box::into_raw` in `set_entry` and is
    // consumed exactly once, here, per prime.
    let entry: Box<Box<dyn FnOnce()>> = unsafe { Box::from_raw(arg.cast()) };
    (*entry)();

    // The entry closure returned without suspending again: park this
    // context for good by switching back to the resumer. Nothing may
    // switch back into this stack unless `set_entry` re-primes it first.
    let cur = CURRENT.with(Cell::get);
    let ret = RETURN.with(Cell::get);
    debug_assert!(!cur.is_null() && !ret.is_null());

    unsafe {
        let load_sp = *ret;
        arch::switch(cur, load_sp);
    }

    unreachable!("a finished fiber's stack was resumed without being re-primed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn yields_and_resumes_preserve_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let stack = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        let fiber = RawFiber::new(stack);

        let log2 = log.clone();
        fiber.set_entry(Box::new(move || {
            log2.borrow_mut().push("a");
            suspend();
            log2.borrow_mut().push("b");
        }));

        unsafe { fiber.resume() };
        assert_eq!(*log.borrow(), vec!["a"]);

        unsafe { fiber.resume() };
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn reuse_after_completion_runs_again() {
        let stack = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        let fiber = RawFiber::new(stack);
        let count = Rc::new(RefCell::new(0));

        for _ in 0..3 {
            let count2 = count.clone();
            fiber.set_entry(Box::new(move || {
                *count2.borrow_mut() += 1;
            }));
            unsafe { fiber.resume() };
        }

        assert_eq!(*count.borrow(), 3);
    }
}
