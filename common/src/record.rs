//! Kernel to userspace record
//!
//! The layout is packed so the byte count sits at offset 4, directly
//! after the process id. Userspace never casts raw buffers to this
//! type; it decodes the fields from their byte offsets instead.

use crate::constants::{BYTES_OFFSET, PID_OFFSET, RECORD_SIZE};

/// One TCP receive observation
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct RecvRecord {
    /// Thread group id of the receiving process
    pub pid: u32,
    /// Bytes copied to userspace in this call
    pub bytes: u64,
}

impl RecvRecord {
    /// Serialize to the little-endian record layout
    pub fn to_le_bytes(&self) -> [u8; RECORD_SIZE] {
        let pid = self.pid;
        let bytes = self.bytes;

        let mut out = [0u8; RECORD_SIZE];
        out[PID_OFFSET..BYTES_OFFSET].copy_from_slice(&pid.to_le_bytes());
        out[BYTES_OFFSET..RECORD_SIZE].copy_from_slice(&bytes.to_le_bytes());
        out
    }
}

// Compile-time layout check
const _: () = {
    assert!(core::mem::size_of::<RecvRecord>() == RECORD_SIZE);
};
