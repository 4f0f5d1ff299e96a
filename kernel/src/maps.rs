//! BPF map definitions

use aya_ebpf::{macros::map, maps::PerfEventArray};
use tcprecv_common::RecvRecord;

/// Perf event array carrying receive records to userspace
///
/// The agent opens one buffer per online CPU and drains them on a
/// fixed polling interval.
#[map]
pub static EVENTS: PerfEventArray<RecvRecord> = PerfEventArray::new(0);
