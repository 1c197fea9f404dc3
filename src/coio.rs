//! Cooperative input/output
//!
//! Everything here is a client of the scheduler's park primitive and obeys
//! a single behavioural rule: **after a readiness wakeup the syscall is
//! attempted again — readiness is not a guarantee of success.** The kernel
//! reports readiness level-triggered through `poll(2)`, another party may
//! race the woken fiber to the data, so every loop below treats
//! `EAGAIN`/`EWOULDBLOCK` as "park and retry".
//!
//! All helpers put their descriptors into non-blocking mode themselves.
//! Callers of the raw [`wait`]/[`park_read`]/[`park_write`] primitives must
//! do the same (see [`set_nonblocking`]); the runtime does not enforce it.

use std::convert::TryFrom;
use std::fs::OpenOptions;
use std::io::{self, BufRead, Read, Write};
use std::mem;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::rc::Rc;

use bitflags::bitflags;

use crate::error::Result;
use crate::fiber;
use crate::fiber::sched;

bitflags! {
    /// Readiness events a fiber can park on.
    pub struct CoIoFlags: libc::c_short {
        const READ = libc::POLLIN;
        const WRITE = libc::POLLOUT;
    }
}

/// Parks the current fiber until `fd` reports one of `flags` (or an
/// error/hangup event — an fd closed from elsewhere wakes its fiber, which
/// then observes the failure on its next syscall). Never fails.
///
/// - `fd` - non-blocking file descriptor
/// - `flags` - requested events, a combination of
///   [CoIoFlags::READ | CoIoFlags::WRITE](CoIoFlags)
#[inline(always)]
pub fn wait(fd: RawFd, flags: CoIoFlags) {
    sched::park(fd, flags.bits());
}

/// Shorthand for [`wait`] with [`CoIoFlags::READ`].
#[inline(always)]
pub fn park_read(fd: RawFd) {
    wait(fd, CoIoFlags::READ)
}

/// Shorthand for [`wait`] with [`CoIoFlags::WRITE`].
#[inline(always)]
pub fn park_write(fd: RawFd) {
    wait(fd, CoIoFlags::WRITE)
}

/// Puts `fd` into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Safety: fcntl on a caller-supplied fd.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads into `buf`, parking the fiber for as long as the fd has nothing.
#[inline(always)]
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // Safety: `buf` is writable for its full length.
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
        park_read(fd);
    }
}

/// Writes from `buf`, parking the fiber for as long as the fd is full.
#[inline(always)]
pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        // Safety: `buf` is readable for its full length.
        let rc = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
        park_write(fd);
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoIoStream
////////////////////////////////////////////////////////////////////////////////

const READ_BUFFER_SIZE: usize = 8192;

/// An owned non-blocking file descriptor whose reads and writes suspend the
/// calling fiber instead of blocking the thread.
///
/// The stream buffers reads (so [`read_until`](CoIoStream::read_until) never
/// consumes bytes past the delimiter) and closes the fd on drop.
pub struct CoIoStream {
    fd: RawFd,
    rbuf: Vec<u8>,
    rpos: usize,
}

impl CoIoStream {
    /// Takes ownership of an fd-like object and puts it into non-blocking
    /// mode.
    pub fn new<T>(inner: T) -> io::Result<CoIoStream>
    where
        T: IntoRawFd,
    {
        let fd = inner.into_raw_fd();
        if let Err(err) = set_nonblocking(fd) {
            // Safety: we own the fd and hand it back to nobody.
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self::from_raw(fd))
    }

    pub(crate) fn from_raw(fd: RawFd) -> CoIoStream {
        CoIoStream {
            fd,
            rbuf: Vec::new(),
            rpos: 0,
        }
    }

    /// Appends bytes up to and including `delim` to `buf`. Returns how many
    /// bytes were appended; 0 means end of stream. Bytes after the
    /// delimiter stay buffered for the next read.
    #[inline(always)]
    pub fn read_until(&mut self, delim: u8, buf: &mut Vec<u8>) -> io::Result<usize> {
        BufRead::read_until(self, delim, buf)
    }
}

impl Read for CoIoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Drain buffered bytes first so Read and BufRead can be mixed.
        if self.rpos < self.rbuf.len() {
            let n = (self.rbuf.len() - self.rpos).min(buf.len());
            buf[..n].copy_from_slice(&self.rbuf[self.rpos..self.rpos + n]);
            self.rpos += n;
            return Ok(n);
        }
        read(self.fd, buf)
    }
}

impl BufRead for CoIoStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.rpos >= self.rbuf.len() {
            self.rbuf.resize(READ_BUFFER_SIZE, 0);
            self.rpos = 0;
            match read(self.fd, &mut self.rbuf) {
                Ok(n) => self.rbuf.truncate(n),
                Err(err) => {
                    self.rbuf.clear();
                    return Err(err);
                }
            }
        }
        Ok(&self.rbuf[self.rpos..])
    }

    fn consume(&mut self, amt: usize) {
        self.rpos = (self.rpos + amt).min(self.rbuf.len());
    }
}

impl Write for CoIoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write(self.fd, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for CoIoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for CoIoStream {
    fn into_raw_fd(mut self) -> RawFd {
        let fd = self.fd;
        drop(mem::take(&mut self.rbuf));
        mem::forget(self);
        fd
    }
}

impl Drop for CoIoStream {
    fn drop(&mut self) {
        // Safety: the stream owns its fd.
        unsafe { libc::close(self.fd) };
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoIoListener
////////////////////////////////////////////////////////////////////////////////

/// Polls incoming connections from a wrapped non-blocking socket listener.
pub struct CoIoListener {
    inner: TcpListener,
}

impl CoIoListener {
    /// Binds a non-blocking listener on `addr`.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<CoIoListener> {
        let inner = TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(CoIoListener { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts a new incoming connection from this listener, parking the
    /// fiber until one is pending. The accepted stream is non-blocking.
    pub fn accept(&self) -> io::Result<CoIoStream> {
        loop {
            match self.inner.accept() {
                Ok((stream, _)) => return CoIoStream::new(stream),
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        park_read(self.inner.as_raw_fd());
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    pub fn inner_listener(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

impl TryFrom<TcpListener> for CoIoListener {
    type Error = io::Error;

    fn try_from(value: TcpListener) -> io::Result<Self> {
        value.set_nonblocking(true)?;
        Ok(Self { inner: value })
    }
}

/// Binds `addr`, spawns the accept-loop fiber and returns the bound address
/// (ask for port 0 to get an ephemeral one). Every accepted connection is
/// served by a freshly spawned fiber running `on_conn`.
///
/// The listener fiber stays parked on the listening socket whenever no
/// connection is pending; it ends (and logs why) only if accepting fails
/// with a real error.
pub fn tcp_listen<A, F>(addr: A, on_conn: F) -> Result<SocketAddr>
where
    A: ToSocketAddrs,
    F: Fn(CoIoStream) + 'static,
{
    let listener = CoIoListener::bind(addr)?;
    let local = listener.local_addr()?;
    let handler = Rc::new(on_conn);
    fiber::Builder::new()
        .name(format!("listener:{}", local))
        .proc(move || loop {
            match listener.accept() {
                Ok(stream) => {
                    let handler = handler.clone();
                    let spawned = fiber::Builder::new()
                        .name("conn")
                        .proc(move || (*handler)(stream));
                    if let Err(err) = spawned {
                        log::error!("listener on {}: spawning a handler failed: {}", local, err);
                    }
                }
                Err(err) => {
                    log::error!("listener on {} stopped: {}", local, err);
                    return;
                }
            }
        })?;
    Ok(local)
}

////////////////////////////////////////////////////////////////////////////////
// Files
////////////////////////////////////////////////////////////////////////////////

/// Reads the whole file at `path` through the cooperative I/O path,
/// appending to `buf`; returns the number of bytes appended.
pub fn read_file<P: AsRef<Path>>(path: P, buf: &mut Vec<u8>) -> Result<usize> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    let mut stream = CoIoStream::new(file)?;
    let n = stream.read_to_end(buf)?;
    Ok(n)
}

/// Writes `data` to the file at `path` (created or truncated) through the
/// cooperative I/O path.
pub fn write_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    let mut stream = CoIoStream::new(file)?;
    stream.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_until_does_not_consume_past_the_delimiter() {
        std::thread::spawn(|| {
            let mut fds = [0; 2];
            // Safety: `fds` points at two ints.
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            let payload = b"ab\ncd";
            // Safety: `payload` is readable for its full length.
            let n = unsafe { libc::write(fds[1], payload.as_ptr().cast(), payload.len()) };
            assert_eq!(n, payload.len() as isize);
            unsafe { libc::close(fds[1]) };

            set_nonblocking(fds[0]).unwrap();
            let mut stream = CoIoStream::from_raw(fds[0]);
            let mut line = Vec::new();
            assert_eq!(stream.read_until(b'\n', &mut line).unwrap(), 3);
            assert_eq!(line, b"ab\n");
            line.clear();
            assert_eq!(stream.read_until(b'\n', &mut line).unwrap(), 2);
            assert_eq!(line, b"cd");
            line.clear();
            assert_eq!(stream.read_until(b'\n', &mut line).unwrap(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn set_nonblocking_reports_bad_fds() {
        assert!(set_nonblocking(-1).is_err());
    }
}
