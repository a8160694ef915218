//! x86_64 System V calling-convention glue around `weftio_fiber_switch.s`.

/// Number of bytes the prepared "never yet entered" stack frame occupies:
/// six callee-saved registers plus a return address.
pub(crate) const FRAME_BYTES: usize = 7 * 8;

extern "C" {
    fn weftio_fiber_switch(save_sp: *mut *mut u8, load_sp: *mut u8);
    fn weftio_fiber_trampoline();
}

/// Switches the current hardware context onto `load_sp`, stashing the
/// context being left through `save_sp`.
///
/// # Safety
/// `load_sp` must point at a stack previously produced by [`prepare_stack`]
/// or previously saved into a `save_sp` slot by a prior call to this
/// function on the same thread.
#[inline]
pub(crate) unsafe fn switch(save_sp: *mut *mut u8, load_sp: *mut u8) {
    unsafe { weftio_fiber_switch(save_sp, load_sp) }
}

/// Lays out a fresh stack so that switching into it for the first time
/// lands in `weftio_fiber_trampoline` with `arg` as its sole argument.
///
/// # Safety
/// `stack_top` must be the one-past-the-end address of at least
/// `FRAME_BYTES` (rounded down for alignment) writable bytes.
pub(crate) unsafe fn prepare_stack(stack_top: *mut u8, arg: *mut u8) -> *mut u8 {
    let base = ((stack_top as usize - FRAME_BYTES) & !0xf) as *mut u8;
    let words = base.cast::<u64>();

    unsafe {
        // Popped in this order by `weftio_fiber_switch`: r15, r14, r13,
        // r12, rbx, rbp, then `ret` consumes the return address.
        words.add(0).write(0); // r15
        words.add(1).write(0); // r14
        words.add(2).write(0); // r13
        words.add(3).write(arg as u64); // r12: carries the start argument
        words.add(4).write(0); // rbx
        words.add(5).write(0); // rbp
        words.add(6).write(weftio_fiber_trampoline as usize as u64); // "return" address
    }

    base
}
