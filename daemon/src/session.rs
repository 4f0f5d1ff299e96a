//! Probe session lifecycle
//!
//! A `ProbeSession` owns one attached kernel probe and at most one open
//! event channel. It moves through
//!
//! ```text
//! Uninitialized -> Attaching -> Streaming -> Detaching -> Closed
//!                       |            |                      ^
//!                       +------------+---- (failure) -------+
//! ```
//!
//! `poll` and `detach` both take `&mut self`, so a detach can never
//! release the buffer while a poll, and the record handler it drives,
//! is still running.

use crate::error::{AttachError, ChannelError, PollError};
use crate::loader::{PollSummary, ProbeLoader, ProbeTarget, RecordBuffer};
use crate::types::RawRecord;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating channel handles unique across sessions
static CHANNEL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Record handler invoked once per raw record during `poll`
pub type RecordHandler = Box<dyn FnMut(RawRecord<'_>) + Send>;

/// Lifecycle state of a probe session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Attaching,
    Streaming,
    Detaching,
    Closed,
}

/// Opaque handle to a session's open event channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(u64);

struct EventChannel<B> {
    handle: ChannelHandle,
    name: String,
    buffer: B,
    on_record: RecordHandler,
}

/// One attached kernel observation point
pub struct ProbeSession<L: ProbeLoader> {
    loader: L,
    state: SessionState,
    target: ProbeTarget,
    probe: Option<L::Handle>,
    channel: Option<EventChannel<L::Buffer>>,
}

impl<L: ProbeLoader> ProbeSession<L> {
    /// Load the probe object and attach it to the target kernel function
    ///
    /// Returns a session in `Streaming` state. On failure, anything that
    /// was loaded is released before the error is returned.
    pub fn attach(mut loader: L, target: ProbeTarget) -> Result<Self, AttachError> {
        let mut state = SessionState::Uninitialized;
        transition(&mut state, SessionState::Attaching);

        let probe = match load_and_attach(&mut loader, &target) {
            Ok(probe) => probe,
            Err(e) => {
                transition(&mut state, SessionState::Closed);
                return Err(e);
            }
        };

        transition(&mut state, SessionState::Streaming);
        info!(
            "Probe {} attached to {}",
            target.program, target.kernel_symbol
        );

        Ok(Self {
            loader,
            state,
            target,
            probe: Some(probe),
            channel: None,
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Target this session was attached with
    pub fn target(&self) -> &ProbeTarget {
        &self.target
    }

    /// Open the named kernel buffer and register its record handler
    ///
    /// The handler runs synchronously inside `poll` and must not block.
    pub fn open_event_channel<F>(
        &mut self,
        channel_name: &str,
        on_record: F,
    ) -> Result<ChannelHandle, ChannelError>
    where
        F: FnMut(RawRecord<'_>) + Send + 'static,
    {
        if self.state != SessionState::Streaming {
            return Err(ChannelError::SessionClosed);
        }
        if self.channel.is_some() {
            return Err(ChannelError::AlreadyOpen);
        }

        let probe = self.probe.as_mut().ok_or(ChannelError::SessionClosed)?;
        let buffer = self.loader.open_perf_buffer(probe, channel_name)?;

        let handle = ChannelHandle(CHANNEL_ID_COUNTER.fetch_add(1, Ordering::Relaxed));
        self.channel = Some(EventChannel {
            handle,
            name: channel_name.to_string(),
            buffer,
            on_record: Box::new(on_record),
        });
        info!("Event channel {} open", channel_name);

        Ok(handle)
    }

    /// Drain all available records through the channel's handler
    ///
    /// A buffer failure closes the session before the error is returned.
    pub fn poll(&mut self, handle: ChannelHandle) -> Result<PollSummary, PollError> {
        if self.state != SessionState::Streaming {
            return Err(PollError::SessionClosed);
        }

        let channel = match self.channel.as_mut() {
            Some(channel) if channel.handle == handle => channel,
            _ => return Err(PollError::UnknownChannel),
        };

        match channel.buffer.poll(&mut *channel.on_record) {
            Ok(summary) => {
                if summary.lost > 0 {
                    warn!(
                        "{} records lost on channel {} (buffer overrun)",
                        summary.lost, channel.name
                    );
                }
                Ok(summary)
            }
            Err(e) => {
                warn!("Poll failed on channel {}: {}", channel.name, e);
                self.release();
                transition(&mut self.state, SessionState::Closed);
                Err(e)
            }
        }
    }

    /// Release the event channel and the probe attachment
    ///
    /// Idempotent; always leaves the session `Closed`.
    pub fn detach(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        transition(&mut self.state, SessionState::Detaching);
        self.release();
        transition(&mut self.state, SessionState::Closed);
        info!("Probe detached from {}", self.target.kernel_symbol);
    }

    // Buffer first: it reads from maps owned by the probe object.
    fn release(&mut self) {
        if let Some(channel) = self.channel.take() {
            debug!("Closing event channel {}", channel.name);
            drop(channel);
        }
        self.probe.take();
    }
}

impl<L: ProbeLoader> Drop for ProbeSession<L> {
    fn drop(&mut self) {
        self.detach();
    }
}

fn load_and_attach<L: ProbeLoader>(
    loader: &mut L,
    target: &ProbeTarget,
) -> Result<L::Handle, AttachError> {
    let bytecode = target.object.bytecode()?;
    let mut probe = loader.load(&bytecode)?;
    // Dropping the handle unloads the object if the attach is refused
    loader.attach_kprobe(&mut probe, &target.kernel_symbol, &target.program)?;
    Ok(probe)
}

fn transition(state: &mut SessionState, next: SessionState) {
    debug!("Probe session {:?} -> {:?}", state, next);
    *state = next;
}
