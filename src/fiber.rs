//! Cooperative multitasking module
//!
//! With the fiber module, you can:
//! - create and run [fibers](Builder) — cooperative tasks with their own
//!   stack,
//! - give up the CPU voluntarily with [`yield_now`],
//! - drive the whole runtime to quiescence with [`main_loop`].
//!
//! A fiber has four possible states: **running** (exactly one at a time),
//! **runnable**, **parked** or **retired**. A spawned fiber is appended to
//! the runnable set and first runs at the spawner's next suspension point.
//! It parks by waiting for readiness on a file descriptor (see
//! [`coio`](crate::coio)) and retires when its entry function returns. A
//! retired fiber's id is recycled by a later spawn; its stack mapping is
//! kept and reused.
//!
//! There are exactly three suspension points: [`yield_now`],
//! [`coio::park_read`](crate::coio::park_read) and
//! [`coio::park_write`](crate::coio::park_write) (the latter two via
//! [`coio::wait`](crate::coio::wait)). Code that does not reach one of them
//! runs to completion before any other fiber runs.
//!
//! The runtime lives in a thread local: the first touch on a thread makes
//! that thread fiber id 0, the one fiber that is never allowed to retire.

use std::fmt;
use std::os::raw::c_void;

pub(crate) mod context;
pub(crate) mod sched;
pub(crate) mod stack;

mod csw;
pub use csw::check_yield;
pub use csw::csw;
pub use csw::YieldResult;

pub use stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

use crate::error::{Error, Result};

////////////////////////////////////////////////////////////////////////////////
// FiberId
////////////////////////////////////////////////////////////////////////////////

/// Stable integer handle of a fiber.
///
/// Id 0 names the initial fiber (the OS thread itself). Ids of retired
/// fibers are recycled, most recently retired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub(crate) u32);

impl FiberId {
    #[inline(always)]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

/// The scheduling state of a fiber. Exactly one fiber is `Running` at any
/// instant; every live fiber is in exactly one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Runnable,
    Parked,
    Retired,
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// Methods can be chained on it in order to configure it. The currently
/// supported configurations are:
///
/// * `name`:       specifies an associated name for the fiber (diagnostics
///                 and logging only)
/// * `stack_size`: specifies the desired stack size for the fiber
///
/// The [`proc`](Builder::proc) method consumes the builder and spawns the
/// fiber. The [`fiber::spawn`](spawn) free function uses a `Builder` with
/// default configuration and unwraps its return value.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    /// Generates the base configuration for spawning a fiber, from which
    /// configuration methods can be chained.
    pub fn new() -> Self {
        Builder {
            name: None,
            stack_size: None,
        }
    }

    /// Names the fiber-to-be.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the usable size of the stack (in bytes) for the new fiber.
    ///
    /// Must be at least [`MIN_STACK_SIZE`]; the value is rounded up to a
    /// whole number of pages.
    pub fn stack_size(mut self, stack_size: usize) -> Result<Self> {
        if stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidStackSize {
                requested: stack_size,
                reason: "smaller than MIN_STACK_SIZE",
            });
        }
        self.stack_size = Some(stack_size);
        Ok(self)
    }

    /// Spawns a new fiber running `f`, returning its id.
    ///
    /// The new fiber is appended to the runnable set: it first runs at the
    /// spawner's next suspension point, not immediately. When `f` returns
    /// the fiber retires — its region is released, its id becomes
    /// recyclable and its stack mapping is kept for reuse.
    pub fn proc<F>(self, f: F) -> Result<FiberId>
    where
        F: FnOnce() + 'static,
    {
        let name = self.name.unwrap_or_else(|| "<fiber>".into());
        let stack_size = self.stack_size.unwrap_or(DEFAULT_STACK_SIZE);
        Ok(sched::with(|s| s.spawn(name, stack_size, Box::new(f))))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// Spawns a fiber with the default configuration.
///
/// Equivalent to `Builder::new().proc(f)` with the result unwrapped (the
/// default configuration cannot be rejected).
#[inline(always)]
pub fn spawn<F>(f: F) -> FiberId
where
    F: FnOnce() + 'static,
{
    Builder::new().proc(f).unwrap()
}

/// Function-pointer flavour of [`spawn`] for interop with code that has no
/// closures to offer.
///
/// # Safety
///
/// `arg` must remain valid for as long as `f` uses it; the runtime passes
/// it through untouched.
pub unsafe fn spawn_raw(f: extern "C" fn(*mut c_void), arg: *mut c_void) -> FiberId {
    let arg = arg as usize;
    spawn(move || f(arg as *mut c_void))
}

/// Voluntarily gives up the CPU.
///
/// The calling fiber stays runnable; the next runnable fiber (in
/// round-robin order) runs. Freshly ready parked fibers are collected
/// first, so a spinning fiber cannot starve a parked one. With no other
/// runnable fiber this returns immediately — it never blocks.
#[inline(always)]
pub fn yield_now() {
    sched::yield_now()
}

/// Returns the id of the calling fiber.
#[inline(always)]
pub fn current_id() -> FiberId {
    sched::with(|s| s.running())
}

/// Returns the number of non-retired fibers, the caller included.
#[inline(always)]
pub fn live_count() -> usize {
    sched::with(|s| s.live_count())
}

/// Returns the scheduling state of `id`, or `None` for an id this runtime
/// never issued.
#[inline(always)]
pub fn state(id: FiberId) -> Option<State> {
    sched::with(|s| s.state_of(id))
}

/// Runs the scheduler until the calling fiber is the only live fiber and no
/// fiber is parked, then returns the process exit code.
///
/// This is the idle loop an application's entry fiber calls after spawning
/// its initial fibers. While other fibers are runnable it simply yields;
/// when everything else is parked it blocks in the readiness poll instead
/// of spinning.
pub fn main_loop() -> i32 {
    sched::main_loop()
}
