//! Error types for the telemetry pipeline
//!
//! Setup failures (`AttachError`, `ChannelError`) and runtime probe
//! failures (`PollError`) are fatal to the pipeline and surface to the
//! caller. `DecodeError` and `SubscriberSendError` stay local to one
//! record or one subscriber.

use std::io;
use thiserror::Error;

/// Malformed kernel record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than a full record
    #[error("record too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
}

/// Failure to load or attach the kernel probe
#[derive(Error, Debug)]
pub enum AttachError {
    /// Probe object missing, unreadable, or rejected by the loader
    #[error("failed to load probe object: {0}")]
    LoadFailed(String),

    /// Kernel refused the attachment (privilege, missing symbol, kernel version)
    #[error("failed to attach {program} to {symbol}: {reason}")]
    AttachFailed {
        program: String,
        symbol: String,
        reason: String,
    },
}

/// Failure to open the kernel event channel
#[derive(Error, Debug)]
pub enum ChannelError {
    /// No map with this name in the probe object
    #[error("event channel {0} not found in probe object")]
    NotFound(String),

    /// Map exists but could not be opened as a perf buffer
    #[error("failed to open event channel {name}: {reason}")]
    OpenFailed { name: String, reason: String },

    /// The session already has a channel
    #[error("an event channel is already open on this session")]
    AlreadyOpen,

    /// The session is not streaming
    #[error("probe session is closed")]
    SessionClosed,
}

/// Runtime failure while draining the kernel buffer
#[derive(Error, Debug)]
pub enum PollError {
    /// Reading a CPU buffer failed
    #[error("failed to read events from CPU {cpu}: {reason}")]
    ReadFailed { cpu: u32, reason: String },

    /// Handle does not belong to this session's open channel
    #[error("unknown event channel handle")]
    UnknownChannel,

    /// The session is not streaming
    #[error("probe session is closed")]
    SessionClosed,
}

/// Per-subscriber delivery failure
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberSendError {
    /// Subscriber's queue is at capacity
    #[error("subscriber queue full")]
    QueueFull,

    /// Subscriber's connection task has gone away
    #[error("subscriber disconnected")]
    Disconnected,
}

/// Transport server failure
#[derive(Error, Debug)]
pub enum ServerError {
    /// Could not bind the listening endpoint
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    /// I/O error while serving
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
