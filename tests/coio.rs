//! Cooperative I/O end to end: echo servers driven by blocking std clients
//! on separate OS threads, file helpers, subprocess drainage.

use std::cell::Cell;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use strand::{coio, fiber, popen};

/// Runs the scenario on a fresh OS thread so it gets a pristine runtime.
fn in_runtime(f: impl FnOnce() + Send + 'static) {
    std::thread::spawn(f).join().unwrap();
}

/// Echoes whole lines back until EOF or a `quit` line.
fn echo_handler(mut conn: coio::CoIoStream) {
    let mut line = Vec::new();
    loop {
        line.clear();
        match conn.read_until(b'\n', &mut line) {
            Ok(0) => return,
            Ok(_) => {
                if line.as_slice() == b"quit\n" {
                    return;
                }
                conn.write_all(&line).unwrap();
            }
            Err(_) => return,
        }
    }
}

#[test]
fn echo_single_client() {
    in_runtime(|| {
        let addr = coio::tcp_listen(("127.0.0.1", 0), echo_handler).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let client = thread::spawn(move || {
            let mut sock = BufReader::new(TcpStream::connect(addr).unwrap());
            for msg in ["hello\n", "world\n"] {
                sock.get_mut().write_all(msg.as_bytes()).unwrap();
                let mut line = String::new();
                sock.read_line(&mut line).unwrap();
                assert_eq!(line, *msg);
            }
            sock.get_mut().write_all(b"quit\n").unwrap();
            let mut rest = Vec::new();
            sock.read_to_end(&mut rest).unwrap();
            assert!(rest.is_empty());
            flag.store(true, Ordering::SeqCst);
        });

        while !done.load(Ordering::SeqCst) {
            fiber::yield_now();
        }
        client.join().unwrap();
        // The connection handler has retired; listener + main remain.
        while fiber::live_count() > 2 {
            fiber::yield_now();
        }
        assert_eq!(fiber::live_count(), 2);
    });
}

#[test]
fn echo_serves_two_simultaneous_clients() {
    in_runtime(|| {
        let addr = coio::tcp_listen(("127.0.0.1", 0), echo_handler).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let finished = Arc::new(AtomicUsize::new(0));
        let mut clients = Vec::new();
        for tag in ['x', 'y'] {
            let barrier = barrier.clone();
            let finished = finished.clone();
            clients.push(thread::spawn(move || {
                let mut sock = BufReader::new(TcpStream::connect(addr).unwrap());
                barrier.wait();
                for round in 0..2 {
                    let msg = format!("{}{}\n", tag, round);
                    sock.get_mut().write_all(msg.as_bytes()).unwrap();
                    let mut line = String::new();
                    sock.read_line(&mut line).unwrap();
                    assert_eq!(line, msg);
                    if round == 0 {
                        thread::sleep(Duration::from_millis(10));
                    }
                }
                sock.get_mut().write_all(b"quit\n").unwrap();
                finished.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Both clients must complete: one reap serves every ready fd, so
        // neither connection can starve the other.
        while finished.load(Ordering::SeqCst) < 2 {
            fiber::yield_now();
        }
        for client in clients {
            client.join().unwrap();
        }
    });
}

#[test]
fn busy_worker_and_listener_both_make_progress() {
    in_runtime(|| {
        let counter = Rc::new(Cell::new(0u32));
        let ticks = counter.clone();
        fiber::Builder::new()
            .name("counter")
            .proc(move || {
                for _ in 0..1000 {
                    ticks.set(ticks.get() + 1);
                    fiber::yield_now();
                }
            })
            .unwrap();

        let addr = coio::tcp_listen(("127.0.0.1", 0), echo_handler).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let client = thread::spawn(move || {
            let mut sock = BufReader::new(TcpStream::connect(addr).unwrap());
            sock.get_mut().write_all(b"ping\n").unwrap();
            let mut line = String::new();
            sock.read_line(&mut line).unwrap();
            assert_eq!(line, "ping\n");
            flag.store(true, Ordering::SeqCst);
        });

        while !done.load(Ordering::SeqCst) {
            fiber::yield_now();
        }
        client.join().unwrap();
        while counter.get() < 1000 {
            fiber::yield_now();
        }
        assert_eq!(counter.get(), 1000);
    });
}

#[test]
fn file_round_trip() {
    in_runtime(|| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.txt");
        coio::write_file(&path, b"all that is written may be read\n").unwrap();
        let mut buf = Vec::new();
        let n = coio::read_file(&path, &mut buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(buf, b"all that is written may be read\n".to_vec());
    });
}

#[test]
fn read_file_surfaces_missing_paths() {
    in_runtime(|| {
        let mut buf = Vec::new();
        assert!(coio::read_file("/nonexistent/strand-test", &mut buf).is_err());
    });
}

#[test]
fn popen_drains_both_pipes() {
    in_runtime(|| {
        let mut child = popen::popen("echo out-line; echo err-line 1>&2").unwrap();
        let mut out = Vec::new();
        child.stdout.read_to_end(&mut out).unwrap();
        let mut err = Vec::new();
        child.stderr.read_to_end(&mut err).unwrap();
        assert_eq!(out, b"out-line\n".to_vec());
        assert_eq!(err, b"err-line\n".to_vec());
        assert!(child.wait().unwrap().success());
    });
}
