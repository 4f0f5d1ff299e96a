//! Kernel record decoding
//!
//! Turns the fixed-layout bytes emitted by the kernel probe into a
//! `TelemetryEvent`. The kernel does not send a timestamp; the event is
//! stamped with wall-clock time at decode.

use crate::error::DecodeError;
use crate::types::{RawRecord, TelemetryEvent};
use tcprecv_common::constants::{BYTES_OFFSET, PID_OFFSET, RECORD_SIZE};

/// Decode a record, stamping it with the current time
pub fn decode(raw: RawRecord<'_>) -> Result<TelemetryEvent, DecodeError> {
    decode_at(raw, chrono::Utc::now().timestamp_millis())
}

/// Decode a record with an explicit timestamp
///
/// Bytes past `RECORD_SIZE` are ignored. Field values are not validated.
pub fn decode_at(raw: RawRecord<'_>, observed_at_millis: i64) -> Result<TelemetryEvent, DecodeError> {
    let data = raw.data;
    if data.len() < RECORD_SIZE {
        return Err(DecodeError::TooShort {
            len: data.len(),
            min: RECORD_SIZE,
        });
    }

    let mut pid = [0u8; 4];
    pid.copy_from_slice(&data[PID_OFFSET..BYTES_OFFSET]);

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[BYTES_OFFSET..RECORD_SIZE]);

    Ok(TelemetryEvent::new(
        u32::from_le_bytes(pid),
        u64::from_le_bytes(bytes),
        observed_at_millis,
    ))
}
