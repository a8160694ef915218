use std::ptr::NonNull;

use rustix::mm::{mmap_anonymous, mprotect, munmap, MapFlags, MprotectFlags, ProtFlags};
use rustix::param::page_size;

/// Default stack size for a fiber (131072 bytes).
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("failed to mmap a {size}-byte fiber stack: {source}")]
    Mmap {
        size: usize,
        source: rustix::io::Errno,
    },
    #[error("failed to protect the guard page of a fiber stack: {source}")]
    GuardPage { source: rustix::io::Errno },
}

/// An owned, guard-paged fiber stack.
///
/// The allocation is one guard page (`PROT_NONE`, catches overflow with a
/// `SIGSEGV` instead of silent corruption) followed by `len` usable bytes.
/// A heap (`malloc`-style) allocator would suffice for the stack allocator
/// role this fills, which can swap in a pooled or guard-page allocator
/// without touching any other component; we start with the guard-page one
/// since `rustix`'s `mm` feature is already part of the dependency stack.
pub struct Stack {
    base: NonNull<u8>,
    mapped_len: usize,
    usable_len: usize,
}

// Safety: the mapping is exclusively owned by this `Stack` and only ever
// touched by the single OS thread running the fiber built on top of it.
unsafe impl Send for Stack {}

impl Stack {
    pub fn new(size: usize) -> Result<Self, StackError> {
        let page = page_size();
        let usable_len = size.max(page).next_multiple_of(page);
        let mapped_len = usable_len + page;

        // Safety: anonymous, not backed by any fd, no particular address
        // requested.
        let base = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                mapped_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }
        .map_err(|source| StackError::Mmap {
            size: mapped_len,
            source,
        })?;

        // Safety: `base` was just mapped read-write for `mapped_len` bytes;
        // shrinking the first page to no access is in-bounds.
        unsafe { mprotect(base, page, MprotectFlags::empty()) }
            .map_err(|source| StackError::GuardPage { source })?;

        Ok(Self {
            base: NonNull::new(base.cast()).expect("mmap never returns null on success"),
            mapped_len,
            usable_len,
        })
    }

    /// The one-past-the-end address of the usable (non-guard) region —
    /// where a stack pointer starts, since the stack grows down.
    pub fn top(&self) -> *mut u8 {
        // Safety: `mapped_len - usable_len` (one page) is within the
        // mapping, landing exactly at the end of the guard page / start
        // of the usable region; adding `usable_len` lands one-past-end.
        unsafe {
            self.base
                .as_ptr()
                .add(self.mapped_len - self.usable_len)
                .add(self.usable_len)
        }
    }

    pub fn len(&self) -> usize {
        self.usable_len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: `base`/`mapped_len` exactly match the earlier `mmap`.
        unsafe {
            let _ = munmap(self.base.as_ptr().cast(), self.mapped_len);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("top", &self.top())
            .field("len", &self.usable_len)
            .finish()
    }
}
