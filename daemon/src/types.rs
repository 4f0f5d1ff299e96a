//! Userspace type definitions
//!
//! Defines the values flowing through the agent, from the raw bytes
//! handed over by the kernel to the JSON message pushed to subscribers.
//!
//! ## Organization
//!
//! - **Kernel Types**: the record layout shared with the eBPF program
//! - **Pipeline Types**: decoded events and raw record views
//! - **Wire Types**: the serialized form sent to subscribers

use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between the kernel eBPF program and userspace
    //!
    //! Re-exported from the tcprecv-common crate.

    pub use tcprecv_common::constants;
    pub use tcprecv_common::RecvRecord;
}

// ============================================================================
// Pipeline Types
// ============================================================================

/// Raw record as delivered by the kernel buffer
///
/// Borrowed from the perf buffer for the duration of one handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord<'a> {
    /// CPU whose buffer produced the record
    pub cpu: u32,
    /// Record bytes, at least `RECORD_SIZE` long when well-formed
    pub data: &'a [u8],
}

impl<'a> RawRecord<'a> {
    pub fn new(cpu: u32, data: &'a [u8]) -> Self {
        Self { cpu, data }
    }
}

/// One decoded TCP receive observation
///
/// Fields are private so an event cannot change after decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryEvent {
    process_id: u32,
    byte_count: u64,
    observed_at_millis: i64,
}

impl TelemetryEvent {
    pub fn new(process_id: u32, byte_count: u64, observed_at_millis: i64) -> Self {
        Self {
            process_id,
            byte_count,
            observed_at_millis,
        }
    }

    /// Process that received the data
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Bytes copied to the process
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    /// Wall-clock time of decoding, in epoch milliseconds
    pub fn observed_at_millis(&self) -> i64 {
        self.observed_at_millis
    }

    /// Build the wire representation with the given byte count encoding
    pub fn to_wire(&self, encoding: ByteCountEncoding) -> WireEvent {
        let bytes = match encoding {
            ByteCountEncoding::Number => WireByteCount::Number(self.byte_count),
            ByteCountEncoding::String => WireByteCount::Text(self.byte_count.to_string()),
        };

        WireEvent {
            pid: self.process_id,
            bytes,
            timestamp: self.observed_at_millis,
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Serialized message shared by every subscriber of one broadcast
///
/// Reference-counted UTF-8 bytes: cloning for another subscriber, and
/// turning it into a text frame, never copies the payload.
pub type WireMessage = Utf8Bytes;

/// How the 64-bit byte count is written in JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteCountEncoding {
    /// Plain JSON number (exact for any u64)
    #[default]
    Number,
    /// Decimal string, for consumers whose numbers are IEEE doubles
    String,
}

/// JSON message pushed to subscribers
///
/// `{"pid": 7, "bytes": 1024, "timestamp": 1700000000000}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WireEvent {
    /// Process ID
    pub pid: u32,
    /// Byte count, as a number or a decimal string
    pub bytes: WireByteCount,
    /// Epoch milliseconds at decode time
    pub timestamp: i64,
}

/// Byte count in either of its two JSON forms
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum WireByteCount {
    Number(u64),
    Text(String),
}

impl WireEvent {
    /// Serialize to a JSON message
    pub fn to_message(&self) -> serde_json::Result<WireMessage> {
        serde_json::to_string(self).map(WireMessage::from)
    }

    /// Convert back into an event
    ///
    /// Fails only if a string byte count is not a valid u64.
    pub fn into_event(self) -> Result<TelemetryEvent, std::num::ParseIntError> {
        let byte_count = match self.bytes {
            WireByteCount::Number(n) => n,
            WireByteCount::Text(s) => s.parse()?,
        };

        Ok(TelemetryEvent::new(self.pid, byte_count, self.timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_number_format() {
        let event = TelemetryEvent::new(7, 1024, 1_700_000_000_000);
        let message = event.to_wire(ByteCountEncoding::Number).to_message().unwrap();

        assert_eq!(
            &*message,
            r#"{"pid":7,"bytes":1024,"timestamp":1700000000000}"#
        );
    }

    #[test]
    fn test_wire_string_format() {
        let event = TelemetryEvent::new(7, u64::MAX, 5);
        let message = event.to_wire(ByteCountEncoding::String).to_message().unwrap();

        assert_eq!(
            &*message,
            r#"{"pid":7,"bytes":"18446744073709551615","timestamp":5}"#
        );
    }

    #[test]
    fn test_wire_preserves_large_byte_counts() {
        // Above 2^53, where a double would round
        let big = (1u64 << 53) + 1;
        let event = TelemetryEvent::new(1, big, 42);

        for encoding in [ByteCountEncoding::Number, ByteCountEncoding::String] {
            let message = event.to_wire(encoding).to_message().unwrap();
            let parsed: WireEvent = serde_json::from_str(&message).unwrap();
            assert_eq!(parsed.into_event().unwrap(), event);
        }
    }

    #[test]
    fn test_wire_rejects_bad_string_count() {
        let parsed: WireEvent =
            serde_json::from_str(r#"{"pid":1,"bytes":"lots","timestamp":0}"#).unwrap();
        assert!(parsed.into_event().is_err());
    }
}
