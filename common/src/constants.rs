//! Names and sizes shared by the kernel probe and the agent
//!
//! The userspace loader looks programs and maps up by name, so these
//! must match the symbols exported by the eBPF object.

// ============================================================================
// Object symbols
// ============================================================================

/// Name of the kprobe program inside the eBPF object
pub const PROGRAM_NAME: &str = "trace_tcp_recv";

/// Kernel function the probe attaches to by default
pub const DEFAULT_KERNEL_SYMBOL: &str = "tcp_cleanup_rbuf";

/// Name of the perf event array carrying `RecvRecord`s
pub const EVENTS_MAP: &str = "EVENTS";

// ============================================================================
// Record layout
// ============================================================================

/// Size of one record on the wire between kernel and userspace
pub const RECORD_SIZE: usize = 12;

/// Byte offset of the little-endian process id
pub const PID_OFFSET: usize = 0;

/// Byte offset of the little-endian byte count
pub const BYTES_OFFSET: usize = 4;
