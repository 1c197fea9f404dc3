//! The fiber scheduler.
//!
//! One scheduler per OS thread, owned by a thread local with an explicit
//! lifecycle; the suspension primitives reach it through that indirection
//! so user code never threads a handle around. The thread that first
//! touches the runtime becomes fiber 0 and runs on the OS-provided stack.
//!
//! The scheduler keeps four tables:
//!
//! - `runnable`, with a cursor `current` naming the running fiber,
//! - `parked` and `poll`, always the same length — element *i* of `parked`
//!   is the fiber waiting on element *i* of `poll`,
//! - `retired`, a LIFO stack of recyclable ids.
//!
//! Scheduling is round-robin over `runnable`. Before every switch the
//! *readiness reap* asks `poll(2)` which parked fds can make progress and
//! appends their fibers to the runnable tail — with zero timeout while
//! anything is runnable, blocking when nothing is.

use std::cell::UnsafeCell;
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use super::context;
use super::stack::Stack;
use super::{FiberId, State};
use crate::region::Region;

/// Aborts with a diagnostic. Reserved for conditions the runtime cannot
/// continue from: scheduler-table OOM, stack mapping failure, impossible
/// poll results, fiber 0 retiring.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        log::error!($($arg)+);
        eprintln!("fatal runtime error: {}", format_args!($($arg)+));
        std::process::abort()
    }};
}

////////////////////////////////////////////////////////////////////////////////
// Fiber slot
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Fiber {
    name: String,
    state: State,
    /// `None` only for fiber 0, which runs on the thread stack.
    stack: Option<Stack>,
    /// Valid only while the fiber is not running.
    saved_sp: *mut u8,
    region: Region,
    entry: Option<Box<dyn FnOnce()>>,
    /// Number of times this fiber has been switched away from.
    csw: u64,
}

////////////////////////////////////////////////////////////////////////////////
// Sched
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Sched {
    fibers: Vec<Fiber>,
    runnable: Vec<FiberId>,
    current: usize,
    parked: Vec<FiberId>,
    poll: Vec<libc::pollfd>,
    retired: Vec<FiberId>,
}

thread_local! {
    static SCHED: UnsafeCell<Sched> = UnsafeCell::new(Sched::for_this_thread());
}

/// Runs `f` with this thread's scheduler.
///
/// Safety of the interior access: the runtime is single threaded and
/// strictly cooperative, and no context switch happens while the borrow is
/// alive — every switch runs *after* the closure returns, on raw pointers
/// the closure prepared.
pub(crate) fn with<T>(f: impl FnOnce(&mut Sched) -> T) -> T {
    SCHED.with(|cell| f(unsafe { &mut *cell.get() }))
}

impl Sched {
    fn for_this_thread() -> Sched {
        let main = Fiber {
            name: "main".into(),
            state: State::Running,
            stack: None,
            saved_sp: ptr::null_mut(),
            region: Region::new(),
            entry: None,
            csw: 0,
        };
        Sched {
            fibers: vec![main],
            runnable: vec![FiberId(0)],
            current: 0,
            parked: Vec::new(),
            poll: Vec::new(),
            retired: Vec::new(),
        }
    }

    /// Id of the running fiber: the runnable entry at the cursor.
    #[inline(always)]
    pub(crate) fn running(&self) -> FiberId {
        self.runnable[self.current]
    }

    #[inline(always)]
    pub(crate) fn live_count(&self) -> usize {
        self.fibers.len() - self.retired.len()
    }

    #[inline(always)]
    pub(crate) fn state_of(&self, id: FiberId) -> Option<State> {
        self.fibers.get(id.index()).map(|f| f.state)
    }

    #[inline(always)]
    pub(crate) fn csw_of(&self, id: FiberId) -> u64 {
        self.fibers[id.index()].csw
    }

    ////////////////////////////////////////////////////////////////////////
    // Spawn
    ////////////////////////////////////////////////////////////////////////

    pub(crate) fn spawn(
        &mut self,
        name: String,
        stack_size: usize,
        entry: Box<dyn FnOnce()>,
    ) -> FiberId {
        let id = match self.retired.pop() {
            Some(id) => {
                let slot = &mut self.fibers[id.index()];
                debug_assert_eq!(slot.state, State::Retired);
                // The kept mapping is reused unless it is too small now.
                let too_small = match slot.stack {
                    Some(ref stack) => stack.usable() < stack_size,
                    None => true,
                };
                if too_small {
                    slot.stack = Some(map_stack(stack_size));
                }
                slot.name = name;
                id
            }
            None => {
                let id = FiberId(self.fibers.len() as u32);
                self.fibers.push(Fiber {
                    name,
                    state: State::Retired,
                    stack: Some(map_stack(stack_size)),
                    saved_sp: ptr::null_mut(),
                    region: Region::new(),
                    entry: None,
                    csw: 0,
                });
                id
            }
        };
        let slot = &mut self.fibers[id.index()];
        let top = slot.stack.as_ref().unwrap().top();
        // Safety: the stack is exclusively this fiber's and currently
        // unused; the first switch into `saved_sp` lands in fiber_main.
        slot.saved_sp = unsafe { context::bootstrap(top, fiber_main) };
        slot.entry = Some(entry);
        slot.state = State::Runnable;
        slot.csw = 0;
        self.runnable.push(id);
        log::debug!("spawned fiber {} ({})", id, self.fibers[id.index()].name);
        self.assert_invariants();
        id
    }

    ////////////////////////////////////////////////////////////////////////
    // Readiness reap
    ////////////////////////////////////////////////////////////////////////

    /// Moves every parked fiber whose fd reports an event (readiness *or*
    /// error/hangup — an externally closed fd must wake its owner) to the
    /// runnable tail, in poll-index order.
    ///
    /// With `block` set, does not return before at least one fd is ready.
    fn reap(&mut self, block: bool) {
        if self.poll.is_empty() {
            return;
        }
        let timeout = if block { -1 } else { 0 };
        let ready = loop {
            // Safety: `poll` holds `len` initialized records.
            let rc = unsafe {
                libc::poll(self.poll.as_mut_ptr(), self.poll.len() as libc::nfds_t, timeout)
            };
            if rc >= 0 {
                break rc;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                fatal!("poll over {} descriptors failed: {}", self.poll.len(), err);
            }
            if !block {
                break 0;
            }
        };
        if ready == 0 {
            return;
        }
        // Compact `parked` and `poll` in tandem so they stay aligned.
        let mut kept = 0;
        for i in 0..self.poll.len() {
            if self.poll[i].revents == 0 {
                self.parked[kept] = self.parked[i];
                self.poll[kept] = self.poll[i];
                kept += 1;
                continue;
            }
            let id = self.parked[i];
            log::trace!(
                "fd {} ready (revents {:#x}), fiber {} runnable again",
                self.poll[i].fd,
                self.poll[i].revents,
                id
            );
            self.fibers[id.index()].state = State::Runnable;
            self.runnable.push(id);
        }
        self.parked.truncate(kept);
        self.poll.truncate(kept);
        self.assert_invariants();
    }

    /// Blocks until some fiber is runnable. Both sets empty means every
    /// fiber retired while another was still expected to run — a runtime
    /// bug, since fiber 0 cannot retire.
    fn wait_runnable(&mut self) {
        while self.runnable.is_empty() {
            if self.parked.is_empty() {
                fatal!("scheduler deadlock: no runnable and no parked fibers");
            }
            self.reap(true);
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Switch preparation
    ////////////////////////////////////////////////////////////////////////

    /// Final bookkeeping for a switch away from `out`: returns the raw
    /// save/load slots the caller must pass to `context::switch` *after*
    /// the scheduler borrow ends. `out`'s state must already be set.
    fn finish_switch(&mut self, out: FiberId, next: FiberId) -> (*mut *mut u8, *const *mut u8) {
        debug_assert_ne!(out, next);
        self.fibers[out.index()].csw += 1;
        self.fibers[next.index()].state = State::Running;
        self.assert_invariants();
        let save = &mut self.fibers[out.index()].saved_sp as *mut *mut u8;
        let load = &self.fibers[next.index()].saved_sp as *const *mut u8;
        (save, load)
    }

    fn prepare_yield(&mut self) -> Option<(*mut *mut u8, *const *mut u8)> {
        self.reap(false);
        let out = self.running();
        self.current = (self.current + 1) % self.runnable.len();
        let next = self.runnable[self.current];
        if next == out {
            return None;
        }
        self.fibers[out.index()].state = State::Runnable;
        Some(self.finish_switch(out, next))
    }

    fn prepare_park(
        &mut self,
        fd: RawFd,
        events: libc::c_short,
    ) -> Option<(*mut *mut u8, *const *mut u8)> {
        let out = self.running();
        log::trace!("fiber {} parks on fd {} (events {:#x})", out, fd, events);
        self.poll.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        self.parked.push(out);
        self.fibers[out.index()].state = State::Parked;
        // swap_remove: the tail fiber inherits the cursor slot. Rotation
        // order shifts by one entry, but every runnable fiber still runs
        // within a cursor lap.
        self.runnable.swap_remove(self.current);
        self.reap(self.runnable.is_empty());
        self.wait_runnable();
        self.current %= self.runnable.len();
        let next = self.runnable[self.current];
        if next == out {
            // The fd was already ready: the reap on this same control path
            // re-woke the parker, no switch needed.
            self.fibers[out.index()].state = State::Running;
            return None;
        }
        Some(self.finish_switch(out, next))
    }

    fn prepare_retire(&mut self) -> (*mut *mut u8, *const *mut u8) {
        let out = self.running();
        if out == FiberId(0) {
            fatal!("fiber 0 reached retire; the initial fiber must never return");
        }
        log::debug!("fiber {} ({}) retired", out, self.fibers[out.index()].name);
        // Everything the fiber allocated dies with it. The stack mapping
        // stays on the slot for the next spawn that recycles the id.
        self.fibers[out.index()].region.release();
        self.fibers[out.index()].entry = None;
        self.fibers[out.index()].state = State::Retired;
        self.retired.push(out);
        self.runnable.swap_remove(self.current);
        self.reap(false);
        if self.runnable.is_empty() {
            if !self.parked.is_empty() {
                // Degenerate fast-path: promote the parked head. The wakeup
                // is spurious; the fiber retries its syscall and re-parks.
                let id = self.parked.swap_remove(0);
                self.poll.swap_remove(0);
                self.fibers[id.index()].state = State::Runnable;
                self.runnable.push(id);
                log::trace!("promoted parked fiber {} after a retire", id);
            }
        }
        self.wait_runnable();
        self.current %= self.runnable.len();
        let next = self.runnable[self.current];
        self.finish_switch(out, next)
    }

    ////////////////////////////////////////////////////////////////////////
    // Invariants
    ////////////////////////////////////////////////////////////////////////

    /// Checked at every observable point in debug builds: set membership is
    /// disjoint and exhaustive, Parked and Poll stay aligned, fiber 0 never
    /// retires, saved stack pointers stay inside their mappings.
    fn assert_invariants(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        assert_eq!(self.parked.len(), self.poll.len());
        let mut seen = vec![0u8; self.fibers.len()];
        for &id in self
            .runnable
            .iter()
            .chain(self.parked.iter())
            .chain(self.retired.iter())
        {
            seen[id.index()] += 1;
        }
        for (index, &count) in seen.iter().enumerate() {
            assert_eq!(count, 1, "fiber {} is in {} scheduler sets", index, count);
        }
        assert!(!self.retired.contains(&FiberId(0)));
        for (index, fiber) in self.fibers.iter().enumerate() {
            if index == 0 || fiber.state == State::Running || fiber.state == State::Retired {
                continue;
            }
            if let Some(ref stack) = fiber.stack {
                let top = stack.top() as usize;
                let sp = fiber.saved_sp as usize;
                assert!(
                    sp >= top - stack.usable() && sp < top,
                    "fiber {} saved sp out of its stack",
                    index
                );
            }
        }
    }
}

fn map_stack(usable: usize) -> Stack {
    match Stack::new(usable) {
        Ok(stack) => stack,
        Err(err) => fatal!("failed to map a {} byte fiber stack: {}", usable, err),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Suspension primitives
////////////////////////////////////////////////////////////////////////////////

pub(crate) fn yield_now() {
    let pair = with(|s| s.prepare_yield());
    if let Some((save, load)) = pair {
        // Safety: slots prepared by the scheduler; borrow already ended.
        unsafe { context::switch(save, load) };
    }
}

pub(crate) fn park(fd: RawFd, events: libc::c_short) {
    let pair = with(|s| s.prepare_park(fd, events));
    if let Some((save, load)) = pair {
        // Safety: as in yield_now.
        unsafe { context::switch(save, load) };
    }
}

pub(crate) fn retire() -> ! {
    let (save, load) = with(|s| s.prepare_retire());
    // Safety: as in yield_now; the saved context is never resumed.
    unsafe { context::switch(save, load) };
    unreachable!("a retired fiber was resumed");
}

pub(crate) fn main_loop() -> i32 {
    loop {
        let quiescent = with(|s| {
            if s.live_count() == 1 && s.parked.is_empty() {
                return true;
            }
            // Nothing but parked fibers left: block in the reap rather
            // than spinning on zero-timeout polls.
            if s.runnable.len() == 1 && !s.parked.is_empty() {
                s.reap(true);
            }
            false
        });
        if quiescent {
            return 0;
        }
        yield_now();
    }
}

/// Runs `f` with the running fiber's region.
pub(crate) fn with_current_region<T>(f: impl FnOnce(&mut Region) -> T) -> T {
    with(|s| {
        let id = s.running();
        f(&mut s.fibers[id.index()].region)
    })
}

////////////////////////////////////////////////////////////////////////////////
// Entry trampoline
////////////////////////////////////////////////////////////////////////////////

/// First frame of every spawned fiber: fetch the entry closure, run it,
/// retire. Panics are contained here — unwinding must never cross the
/// context-switch frame below us.
extern "C" fn fiber_main() -> ! {
    let (id, entry) = with(|s| {
        let id = s.running();
        let entry = match s.fibers[id.index()].entry.take() {
            Some(entry) => entry,
            None => fatal!("fiber {} resumed without an entry function", id),
        };
        (id, entry)
    });
    if let Err(cause) = panic::catch_unwind(AssertUnwindSafe(entry)) {
        let what = cause
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| cause.downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("Box<dyn Any>");
        log::error!("fiber {} panicked: {}", id, what);
    }
    retire()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber;

    /// Every scenario on a fresh thread, so it gets a pristine runtime.
    fn in_fresh_runtime(f: impl FnOnce() + Send + 'static) {
        std::thread::spawn(f).join().unwrap();
    }

    #[test]
    fn membership_is_disjoint_and_exhaustive() {
        in_fresh_runtime(|| {
            for _ in 0..4 {
                fiber::spawn(fiber::yield_now);
            }
            with(|s| {
                assert_eq!(s.runnable.len(), 5);
                assert_eq!(s.parked.len(), 0);
                s.assert_invariants();
            });
            fiber::main_loop();
            with(|s| {
                assert_eq!(s.retired.len(), 4);
                assert!(!s.retired.contains(&FiberId(0)));
                s.assert_invariants();
            });
        });
    }

    #[test]
    fn parked_and_poll_stay_aligned() {
        in_fresh_runtime(|| {
            let mut fds = [0; 2];
            // Safety: `fds` points at two ints.
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            let (rd, wr) = (fds[0], fds[1]);
            crate::coio::set_nonblocking(rd).unwrap();
            fiber::spawn(move || {
                crate::coio::park_read(rd);
                let mut byte = 0u8;
                // Safety: one byte into a stack slot.
                let n = unsafe { libc::read(rd, (&mut byte as *mut u8).cast(), 1) };
                assert_eq!(n, 1);
            });
            fiber::yield_now();
            with(|s| {
                assert_eq!(s.parked.len(), 1);
                assert_eq!(s.poll.len(), 1);
                assert_eq!(s.poll[0].fd, rd);
            });
            // Safety: one byte out of a stack slot.
            assert_eq!(unsafe { libc::write(wr, (&7u8 as *const u8).cast(), 1) }, 1);
            fiber::main_loop();
            with(|s| {
                assert_eq!(s.parked.len(), 0);
                assert_eq!(s.poll.len(), 0);
            });
            unsafe {
                libc::close(rd);
                libc::close(wr);
            }
        });
    }

    #[test]
    fn cursor_always_names_the_running_fiber() {
        in_fresh_runtime(|| {
            assert_eq!(with(|s| s.running()), FiberId(0));
            let seen = std::rc::Rc::new(std::cell::Cell::new(false));
            let flag = seen.clone();
            let id = fiber::spawn(move || {
                assert_eq!(with(|s| s.running()), fiber::current_id());
                flag.set(true);
            });
            assert_ne!(id, FiberId(0));
            fiber::main_loop();
            assert!(seen.get());
        });
    }

    #[test]
    fn panicking_fiber_retires_without_taking_the_runtime_down() {
        in_fresh_runtime(|| {
            let id = fiber::spawn(|| panic!("on purpose"));
            fiber::main_loop();
            assert_eq!(fiber::state(id), Some(State::Retired));
            assert_eq!(fiber::live_count(), 1);
        });
    }
}
