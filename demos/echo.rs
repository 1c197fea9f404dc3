//! Line echo server.
//!
//! ```console
//! $ cargo run --example echo 3000
//! echoing on 0.0.0.0:3000
//! ```

use std::io::Write;

use log::LevelFilter;
use strand::{coio, fiber};

fn main() {
    strand::log::init(LevelFilter::Debug);

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(0);

    let addr = coio::tcp_listen(("0.0.0.0", port), |mut conn| {
        let mut line = Vec::new();
        loop {
            line.clear();
            match conn.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => return,
                Ok(_) => {
                    if conn.write_all(&line).is_err() {
                        return;
                    }
                }
            }
        }
    })
    .expect("failed to start the listener");

    println!("echoing on {}", addr);
    std::process::exit(fiber::main_loop());
}
