//! Fiber stacks.
//!
//! Each fiber owns one anonymous private mapping with a `PROT_NONE` guard
//! page at the low-address end, so runaway recursion faults instead of
//! silently corrupting a neighbour. The mapping outlives the fiber: a
//! retired fiber keeps its stack on the slot and the next spawn that
//! recycles the id reuses it.

use std::io;
use std::ptr::{self, NonNull};

/// Default usable stack size for a new fiber.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest usable stack size [`Builder::stack_size`] accepts.
///
/// [`Builder::stack_size`]: crate::fiber::Builder::stack_size
pub const MIN_STACK_SIZE: usize = 16 * 1024;

#[inline(always)]
pub(crate) fn page_size() -> usize {
    // Safety: sysconf has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An mmap'd fiber stack: `guard` unreadable bytes at the bottom, `usable`
/// writable bytes above them.
pub(crate) struct Stack {
    base: NonNull<u8>,
    len: usize,
    guard: usize,
}

impl Stack {
    /// Maps a stack with at least `usable` writable bytes (rounded up to
    /// whole pages) and one guard page below them.
    pub(crate) fn new(usable: usize) -> io::Result<Stack> {
        let page = page_size();
        let usable = (usable + page - 1) & !(page - 1);
        let len = usable + page;
        // Safety: fresh anonymous mapping, no address hint.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        // Safety: `base` is page-aligned and ours; revoking access to the
        // lowest page makes it the guard.
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base, len) };
            return Err(err);
        }
        // Safety: mmap success is never the null page.
        let base = unsafe { NonNull::new_unchecked(base.cast::<u8>()) };
        Ok(Stack {
            base,
            len,
            guard: page,
        })
    }

    /// Writable bytes above the guard page.
    #[inline(always)]
    pub(crate) fn usable(&self) -> usize {
        self.len - self.guard
    }

    #[inline(always)]
    pub(crate) fn guard(&self) -> usize {
        self.guard
    }

    /// One past the highest mapped byte; the initial stack pointer.
    #[inline(always)]
    pub(crate) fn top(&self) -> *mut u8 {
        // Safety: stays within (one past) the mapping.
        unsafe { self.base.as_ptr().add(self.len) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: we mapped exactly this range.
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_layout() {
        let stack = Stack::new(MIN_STACK_SIZE).unwrap();
        let page = page_size();
        assert_eq!(stack.usable() % page, 0);
        assert!(stack.usable() >= MIN_STACK_SIZE);
        assert_eq!(stack.guard(), page);
        assert_eq!(stack.top() as usize % 16, 0);
        // The full usable range is writable; the guard page sits below it.
        unsafe {
            let lowest = stack.top().sub(stack.usable());
            lowest.write(0xA5);
            stack.top().sub(1).write(0x5A);
            assert_eq!(lowest.read(), 0xA5);
            assert_eq!(stack.top().sub(1).read(), 0x5A);
        }
    }

    #[test]
    fn odd_sizes_round_up_to_pages() {
        let stack = Stack::new(MIN_STACK_SIZE + 1).unwrap();
        assert!(stack.usable() > MIN_STACK_SIZE);
        assert_eq!(stack.usable() % page_size(), 0);
    }
}
