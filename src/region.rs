//! Per-fiber memory regions.
//!
//! A region is a bump allocator over a chain of pages: allocations are
//! monotonic, never move, and are all released together when the owning
//! fiber retires. This fits the request-shaped workload the runtime exists
//! for — a burst of small allocations of unknown total size followed by a
//! complete release — without any per-object bookkeeping.
//!
//! The region of the *current* fiber is reached through [`alloc`] /
//! [`realloc`] / [`used`]; it is created implicitly on the first allocation.
//! Pointers into it stay valid until the fiber retires, and id recycling
//! never revives them — the chain is freed in retire, before the id goes
//! back on the free list.
//!
//! Out of memory is fatal by design: [`Region::alloc`] never returns null,
//! it aborts through [`std::alloc::handle_alloc_error`].

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::mem;
use std::ptr::NonNull;

use crate::fiber::sched;

/// Payload bytes a fresh page holds, unless a single allocation needs more.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Every allocation is aligned to this (the platform max-align).
pub const ALIGN: usize = 16;

// Page header; the payload follows it in the same heap block.
#[repr(C)]
struct Page {
    next: Option<NonNull<Page>>,
    capacity: usize,
    used: usize,
}

// Header size padded so payloads start max-aligned.
const HEADER: usize = (mem::size_of::<Page>() + ALIGN - 1) & !(ALIGN - 1);

thread_local! {
    static LIVE_PAGES: Cell<usize> = Cell::new(0);
}

fn live_pages_add(delta: isize) {
    // try_with: regions owned by the scheduler may be dropped during
    // thread teardown, after this thread local is gone.
    let _ = LIVE_PAGES.try_with(|c| c.set((c.get() as isize + delta) as usize));
}

/// Number of region pages currently allocated on this thread, across all
/// fibers. Lets a test observe that a retiring fiber's pages were actually
/// returned.
pub fn live_pages() -> usize {
    LIVE_PAGES.try_with(|c| c.get()).unwrap_or(0)
}

////////////////////////////////////////////////////////////////////////////////
// Region
////////////////////////////////////////////////////////////////////////////////

/// A chain of bump pages. The head page is the active one; a page that
/// cannot satisfy an allocation is left as-is and a larger-or-default page
/// is prepended.
pub struct Region {
    head: Option<NonNull<Page>>,
    pages: usize,
    /// Most recent allocation — the only block `realloc` may grow in place.
    last: *mut u8,
}

impl Region {
    pub fn new() -> Self {
        Region {
            head: None,
            pages: 0,
            last: std::ptr::null_mut(),
        }
    }

    /// Allocates `size` bytes aligned to [`ALIGN`], valid until
    /// [`release`](Region::release) (for a fiber's region: until the fiber
    /// retires). Never fails — out of memory aborts.
    pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
        let size = round_up(size.max(1));
        let room = match self.head {
            // Safety: head pages are always live and exclusively ours.
            Some(page) => unsafe { page.as_ref().capacity - page.as_ref().used },
            None => 0,
        };
        if room < size {
            self.grow(size);
        }
        let mut page = self.head.unwrap();
        // Safety: the page has at least `size` spare payload bytes.
        unsafe {
            let p = page.as_mut();
            let ptr = page_data(page).add(p.used);
            p.used += size;
            self.last = ptr;
            NonNull::new_unchecked(ptr)
        }
    }

    /// Grows (or shrinks) the block at `ptr` of `old_size` bytes to
    /// `new_size` bytes, returning its possibly new address.
    ///
    /// The block grows in place only if it was the region's most recent
    /// allocation and its page has room; otherwise a fresh block is
    /// allocated and `old_size` bytes are copied — the old space is not
    /// reclaimed. Shrinking always returns `ptr` unchanged.
    pub fn realloc(&mut self, ptr: NonNull<u8>, old_size: usize, new_size: usize) -> NonNull<u8> {
        let old = round_up(old_size.max(1));
        let new = round_up(new_size.max(1));
        if new <= old {
            return ptr;
        }
        if ptr.as_ptr() == self.last {
            // `last` lives in the head page by construction.
            let mut page = self.head.unwrap();
            // Safety: ptr is inside the head page's payload.
            unsafe {
                let offset = ptr.as_ptr() as usize - page_data(page) as usize;
                debug_assert_eq!(offset + old, page.as_ref().used);
                if offset + new <= page.as_ref().capacity {
                    page.as_mut().used = offset + new;
                    return ptr;
                }
            }
        }
        let fresh = self.alloc(new_size);
        // Safety: both blocks are at least `old_size` long and disjoint.
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size) };
        fresh
    }

    fn grow(&mut self, at_least: usize) {
        let capacity = at_least.max(DEFAULT_PAGE_SIZE);
        let layout = page_layout(capacity);
        // Safety: the layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        if raw.is_null() {
            alloc::handle_alloc_error(layout);
        }
        // Safety: just checked non-null; the block fits a Page header.
        let page = unsafe {
            let page = NonNull::new_unchecked(raw.cast::<Page>());
            page.as_ptr().write(Page {
                next: self.head,
                capacity,
                used: 0,
            });
            page
        };
        self.head = Some(page);
        self.pages += 1;
        live_pages_add(1);
    }

    /// Frees the whole chain. Every pointer previously returned by this
    /// region becomes invalid.
    pub fn release(&mut self) {
        let mut next = self.head.take();
        while let Some(page) = next {
            // Safety: pages are only ever produced by `grow`.
            unsafe {
                next = page.as_ref().next;
                alloc::dealloc(page.as_ptr().cast(), page_layout(page.as_ref().capacity));
            }
            live_pages_add(-1);
        }
        self.pages = 0;
        self.last = std::ptr::null_mut();
    }

    /// Total payload bytes handed out of this region.
    pub fn used(&self) -> usize {
        let mut total = 0;
        let mut next = self.head;
        while let Some(page) = next {
            // Safety: live chain.
            unsafe {
                total += page.as_ref().used;
                next = page.as_ref().next;
            }
        }
        total
    }

    #[inline(always)]
    pub fn page_count(&self) -> usize {
        self.pages
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.release();
    }
}

#[inline(always)]
fn round_up(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

fn page_layout(capacity: usize) -> Layout {
    Layout::from_size_align(HEADER + capacity, ALIGN).unwrap()
}

#[inline(always)]
fn page_data(page: NonNull<Page>) -> *mut u8 {
    // Safety: the payload directly follows the padded header.
    unsafe { page.as_ptr().cast::<u8>().add(HEADER) }
}

////////////////////////////////////////////////////////////////////////////////
// Current fiber's region
////////////////////////////////////////////////////////////////////////////////

/// Allocates `size` bytes from the calling fiber's region. The pointer
/// stays valid until the fiber retires.
#[inline(always)]
pub fn alloc(size: usize) -> NonNull<u8> {
    sched::with_current_region(|region| region.alloc(size))
}

/// [`Region::realloc`] on the calling fiber's region.
#[inline(always)]
pub fn realloc(ptr: NonNull<u8>, old_size: usize, new_size: usize) -> NonNull<u8> {
    sched::with_current_region(|region| region.realloc(ptr, old_size, new_size))
}

/// Payload bytes allocated so far by the calling fiber's region.
#[inline(always)]
pub fn used() -> usize {
    sched::with_current_region(|region| region.used())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_and_page_growth() {
        let before = live_pages();
        let mut region = Region::new();
        let a = region.alloc(1);
        let b = region.alloc(3);
        assert_eq!(a.as_ptr() as usize % ALIGN, 0);
        assert_eq!(b.as_ptr() as usize % ALIGN, 0);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, ALIGN);
        assert_eq!(region.page_count(), 1);
        // An oversized allocation gets a page of its own size.
        let big = region.alloc(DEFAULT_PAGE_SIZE * 2);
        assert_eq!(region.page_count(), 2);
        // Safety: the whole block is writable.
        unsafe { std::ptr::write_bytes(big.as_ptr(), 0x5A, DEFAULT_PAGE_SIZE * 2) };
        assert_eq!(live_pages(), before + 2);
        region.release();
        assert_eq!(region.page_count(), 0);
        assert_eq!(region.used(), 0);
        assert_eq!(live_pages(), before);
    }

    #[test]
    fn realloc_grows_the_trailing_block_in_place() {
        let mut region = Region::new();
        let p = region.alloc(16);
        // Safety: 16 writable bytes.
        unsafe { std::ptr::write_bytes(p.as_ptr(), 7, 16) };
        let q = region.realloc(p, 16, 64);
        assert_eq!(p, q);
        assert_eq!(region.used(), 64);
    }

    #[test]
    fn realloc_copies_a_non_trailing_block() {
        let mut region = Region::new();
        let p = region.alloc(16);
        // Safety: 16 writable bytes.
        unsafe { std::ptr::write_bytes(p.as_ptr(), 7, 16) };
        let _other = region.alloc(16);
        let q = region.realloc(p, 16, 64);
        assert_ne!(p, q);
        for i in 0..16 {
            // Safety: the fresh block holds at least 16 copied bytes.
            unsafe { assert_eq!(*q.as_ptr().add(i), 7) };
        }
    }

    #[test]
    fn shrinking_is_a_no_op() {
        let mut region = Region::new();
        let p = region.alloc(64);
        let q = region.realloc(p, 64, 8);
        assert_eq!(p, q);
        assert_eq!(region.used(), 64);
    }

    #[test]
    fn trailing_realloc_falls_back_to_copy_when_the_page_is_full() {
        let mut region = Region::new();
        let p = region.alloc(DEFAULT_PAGE_SIZE - ALIGN);
        // Safety: block is writable for its whole length.
        unsafe { std::ptr::write_bytes(p.as_ptr(), 3, DEFAULT_PAGE_SIZE - ALIGN) };
        let q = region.realloc(p, DEFAULT_PAGE_SIZE - ALIGN, DEFAULT_PAGE_SIZE * 2);
        assert_ne!(p, q);
        assert_eq!(region.page_count(), 2);
        // Safety: copied prefix is readable.
        unsafe { assert_eq!(*q.as_ptr(), 3) };
    }
}
