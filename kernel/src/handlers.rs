//! Kprobe handler for the TCP receive path

use aya_ebpf::{macros::kprobe, programs::ProbeContext};
use tcprecv_common::RecvRecord;

use crate::{helpers::get_pid, maps::EVENTS};

/// Track bytes copied to userspace by TCP receives
///
/// Attached to: tcp_cleanup_rbuf(struct sock *sk, int copied)
#[kprobe]
pub fn trace_tcp_recv(ctx: ProbeContext) -> u32 {
    match try_trace_tcp_recv(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_trace_tcp_recv(ctx: &ProbeContext) -> Result<u32, i64> {
    let copied: i32 = ctx.arg(1).ok_or(1i64)?;

    // Nothing was handed to the reader
    if copied <= 0 {
        return Ok(0);
    }

    let record = RecvRecord {
        pid: get_pid(),
        bytes: copied as u64,
    };
    EVENTS.output(ctx, &record, 0);

    Ok(0)
}
