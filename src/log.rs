//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details
//!
//! The runtime only ever emits through the `log` facade (`trace!` on
//! scheduling steps, `debug!` on fiber lifecycle events, `error!` right
//! before a fatal abort); nothing is printed until a logger is installed.
//!
//! Example:
//! ```no_run
//! use log::{info, LevelFilter};
//!
//! strand::log::init(LevelFilter::Debug);
//! info!("runtime starting");
//! ```

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};

/// [Log](https://docs.rs/log/latest/log/trait.Log.html) trait implementation
/// writing one line per record to standard error.
pub struct StderrLogger {
    max: LevelFilter,
}

impl StderrLogger {
    #[inline(always)]
    pub const fn new(max: LevelFilter) -> Self {
        StderrLogger { max }
    }
}

impl Log for StderrLogger {
    #[inline(always)]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // A failed write to stderr has nowhere better to go.
        let _ = writeln!(
            std::io::stderr(),
            "{:<5} {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    #[inline(always)]
    fn flush(&self) {}
}

/// Install a [`StderrLogger`] as the global logger.
///
/// Does nothing if a logger is already installed.
pub fn init(max: LevelFilter) {
    let logger = Box::leak(Box::new(StderrLogger::new(max)));
    if log::set_logger(logger).is_ok() {
        log::set_max_level(max);
    }
}
