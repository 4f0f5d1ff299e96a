//! Broadcast fan-out
//!
//! Serializes each event once and queues it on every subscriber in the
//! current registry snapshot. Queuing never waits: a subscriber whose
//! queue is full or closed is dealt with on the spot, so one slow or
//! broken client cannot stall the polling loop or the other clients.

use crate::error::SubscriberSendError;
use crate::registry::SubscriberRegistry;
use crate::types::{ByteCountEncoding, TelemetryEvent};
use log::{debug, error, warn};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What to do when a subscriber's queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Deregister the subscriber, closing its connection
    #[default]
    DropSubscriber,
    /// Skip this message for the subscriber and keep it registered
    DropMessage,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop-subscriber" | "subscriber" => Ok(Self::DropSubscriber),
            "drop-message" | "message" => Ok(Self::DropMessage),
            _ => Err(format!(
                "unsupported overflow policy: {}. Use drop-subscriber or drop-message",
                s
            )),
        }
    }
}

/// Outcome of one broadcast
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers in the snapshot
    pub attempted: usize,
    /// Messages queued
    pub delivered: usize,
    /// Messages skipped under `DropMessage`
    pub dropped: usize,
    /// Subscribers removed from the registry
    pub evicted: usize,
}

/// Running totals across broadcasts
#[derive(Debug, Default)]
pub struct BroadcastStats {
    pub broadcasts: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub evicted: AtomicU64,
}

/// Fans decoded events out to every registered subscriber
#[derive(Debug)]
pub struct Broadcaster {
    registry: Arc<SubscriberRegistry>,
    encoding: ByteCountEncoding,
    overflow: OverflowPolicy,
    stats: BroadcastStats,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        encoding: ByteCountEncoding,
        overflow: OverflowPolicy,
    ) -> Self {
        Self {
            registry,
            encoding,
            overflow,
            stats: BroadcastStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &BroadcastStats {
        &self.stats
    }

    /// Deliver one event to every subscriber in the current snapshot
    ///
    /// Per-subscriber failures are isolated and never returned.
    pub fn broadcast(&self, event: &TelemetryEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let message = match event.to_wire(self.encoding).to_message() {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to serialize event {:?}: {}", event, e);
                return report;
            }
        };

        let subscribers = self.registry.snapshot();
        report.attempted = subscribers.len();

        for subscriber in &subscribers {
            match subscriber.try_send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(SubscriberSendError::QueueFull)
                    if self.overflow == OverflowPolicy::DropMessage =>
                {
                    debug!("Subscriber {} queue full, message dropped", subscriber.id());
                    report.dropped += 1;
                }
                Err(e) => {
                    if self.registry.deregister(subscriber.id()) {
                        warn!("Evicting subscriber {}: {}", subscriber.id(), e);
                        report.evicted += 1;
                    }
                }
            }
        }

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.stats
            .evicted
            .fetch_add(report.evicted as u64, Ordering::Relaxed);

        report
    }
}
