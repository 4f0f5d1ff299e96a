//! Helper functions for eBPF programs

use aya_ebpf::helpers::bpf_get_current_pid_tgid;

/// Get current process (thread group) ID
#[inline(always)]
pub fn get_pid() -> u32 {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    (pid_tgid >> 32) as u32
}
