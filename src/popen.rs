//! Cooperative subprocesses.
//!
//! [`popen`] forks and execs a shell command with piped stdout and stderr;
//! the pipes are switched to non-blocking mode and wrapped in
//! [`CoIoStream`]s, so draining them parks the calling fiber instead of
//! blocking the thread. [`Popen::wait`] is cooperative too — it polls the
//! child between yields rather than sitting in `waitpid`.

use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::coio::CoIoStream;
use crate::error::Result;
use crate::fiber;

/// A spawned child process with non-blocking stdout/stderr pipes.
pub struct Popen {
    child: Child,
    pub stdout: CoIoStream,
    pub stderr: CoIoStream,
}

/// Runs `cmd` through `/bin/sh -c` with piped stdout and stderr. The
/// child's stdin is `/dev/null`.
pub fn popen(cmd: &str) -> Result<Popen> {
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    // Both pipes exist: we just asked for them.
    let stdout = CoIoStream::new(child.stdout.take().unwrap())?;
    let stderr = CoIoStream::new(child.stderr.take().unwrap())?;
    log::debug!("spawned subprocess {} for {:?}", child.id(), cmd);
    Ok(Popen {
        child,
        stdout,
        stderr,
    })
}

impl Popen {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Waits for the child to exit without blocking the runtime: polls
    /// `try_wait` and yields in between. Drain the pipes first — a child
    /// blocked on a full pipe never exits.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            fiber::yield_now();
        }
    }

    /// Forces the child to exit.
    pub fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}
