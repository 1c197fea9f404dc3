//! A single-threaded cooperative fiber runtime with readiness-driven I/O.
//!
//! This crate is the scheduling core of a larger web stack. Everything else
//! is built on the three things exposed here:
//!
//! - [Fibers](fiber): spawn cooperative tasks and yield between them
//! - [Cooperative I/O](coio): park a fiber on a file descriptor until the
//!   kernel reports it can make progress
//! - [Regions](region): allocate memory that dies when the owning fiber does
//!
//! plus the thin non-blocking helpers layered on top of them ([`coio`]
//! streams, listeners and file helpers, [subprocess pipes](popen)).
//!
//! The runtime is strictly cooperative and strictly single-threaded: one
//! scheduler per OS thread, at most one fiber executing at any instant, and
//! the only wakeup source is fd readiness reported by `poll(2)`. There are no
//! timers, no preemption, no work stealing and no cross-fiber
//! synchronization primitives; a fiber runs until it yields, parks or
//! returns.
//!
//! ### Example
//!
//! A line echo server (see also `demos/echo.rs`):
//!
//! ```no_run
//! use std::io::Write;
//! use strand::{coio, fiber};
//!
//! let addr = coio::tcp_listen(("127.0.0.1", 0), |mut conn| {
//!     let mut line = Vec::new();
//!     while let Ok(n) = conn.read_until(b'\n', &mut line) {
//!         if n == 0 {
//!             break;
//!         }
//!         if conn.write_all(&line).is_err() {
//!             break;
//!         }
//!         line.clear();
//!     }
//! })
//! .unwrap();
//! println!("listening on {}", addr);
//! fiber::main_loop();
//! ```
pub mod coio;
pub mod error;
pub mod fiber;
pub mod log;
pub mod popen;
pub mod region;

pub use error::Result;
