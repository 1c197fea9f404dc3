//! Error handling utils.
//!
//! Only *recoverable* failures travel through [`Error`]: I/O errors the
//! caller must decide about and invalid fiber configuration. Fatal runtime
//! conditions (out-of-memory in the scheduler's own tables, failure to map a
//! fiber stack, an impossible `poll(2)` result, fiber 0 attempting to
//! retire) never reach this type — they emit a diagnostic and abort the
//! process, because the runtime cannot continue past them.
//!
//! `EAGAIN`/`EWOULDBLOCK` is not an error at all in this crate: it is the
//! signal to park the calling fiber and retry, and is consumed inside the
//! [`coio`](crate::coio) loops.

use std::io;

/// A specialized [`Result`] type for the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all recoverable error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    #[error("invalid stack size {requested}: {reason}")]
    InvalidStackSize {
        requested: usize,
        reason: &'static str,
    },
}
