//! tcprecv - Kernel Space Program
//!
//! Observes the TCP receive path by attaching a kprobe to
//! `tcp_cleanup_rbuf`, which the kernel calls after copying received
//! data to a userspace buffer. Every call that copied at least one byte
//! produces one `RecvRecord` on the `EVENTS` perf event array.
//!
//! ## Architecture
//!
//! ```text
//! tcp_cleanup_rbuf(sk, copied) -> skip if copied <= 0
//!                  |
//!                  v
//! EVENTS (per-CPU perf buffer) -> { pid, bytes }
//!                  |
//!                  v
//! Userspace agent -> poll, decode, fan out to subscribers
//! ```
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release --target=bpfel-unknown-none
//! ```

#![no_std]
#![no_main]

mod handlers;
mod helpers;
mod maps;

pub use handlers::trace_tcp_recv;
pub use maps::EVENTS;

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
