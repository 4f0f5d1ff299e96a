//! TCP Receive Telemetry Agent Library
//!
//! Attaches a kernel probe to the TCP receive path, decodes the records it
//! emits, and fans them out to WebSocket subscribers.
//!
//! ## Pipeline
//!
//! ```text
//! kprobe ──► perf buffer ──► ProbeSession::poll ──► codec::decode
//!                                                       │
//!                       WebSocket ◄── Subscriber ◄── Broadcaster
//! ```

pub mod broadcast;
pub mod codec;
pub mod config;
pub mod error;
pub mod loader;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;

#[cfg(test)]
mod testing;

pub use broadcast::{BroadcastReport, Broadcaster, OverflowPolicy};
pub use config::AgentConfig;
pub use error::{AttachError, ChannelError, DecodeError, PollError, ServerError, SubscriberSendError};
pub use loader::{AyaLoader, ProbeLoader, ProbeObject, ProbeTarget, RecordBuffer};
pub use pipeline::{Pipeline, PipelineStats};
pub use registry::{Subscriber, SubscriberId, SubscriberRegistry};
pub use server::TransportServer;
pub use session::{ChannelHandle, ProbeSession, SessionState};
pub use types::*;
