//! Subscriber registry
//!
//! Tracks the live set of connected subscribers. The transport server
//! adds a subscriber when a connection is accepted and removes it when
//! the connection closes; the broadcaster only reads point-in-time
//! snapshots, so delivery never holds the registry lock.

use crate::error::SubscriberSendError;
use crate::types::WireMessage;
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Counter for generating unique subscriber IDs
static SUBSCRIBER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Default per-subscriber queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Identity of a registered subscriber
pub type SubscriberId = u64;

/// A connected client receiving telemetry messages
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    peer: Option<SocketAddr>,
    sender: mpsc::Sender<WireMessage>,
}

impl Subscriber {
    /// Create a subscriber and the receiving end of its message queue
    ///
    /// The connection task owns the receiver and writes whatever arrives
    /// to the socket. The queue closes once the subscriber is dropped
    /// from the registry and every snapshot holding it is gone.
    pub fn new(peer: Option<SocketAddr>, capacity: usize) -> (Self, mpsc::Receiver<WireMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let subscriber = Self {
            id: SUBSCRIBER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            peer,
            sender,
        };
        (subscriber, receiver)
    }

    #[inline]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remote address, when connected over the network
    #[inline]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue a message without waiting
    pub fn try_send(&self, message: WireMessage) -> Result<(), SubscriberSendError> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SubscriberSendError::QueueFull,
            TrySendError::Closed(_) => SubscriberSendError::Disconnected,
        })
    }
}

/// Live set of subscribers
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<BTreeMap<SubscriberId, Arc<Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber to the live set
    pub fn register(&self, subscriber: Subscriber) -> SubscriberId {
        let id = subscriber.id();
        self.subscribers.write().insert(id, Arc::new(subscriber));
        debug!("Subscriber {} registered", id);
        id
    }

    /// Remove a subscriber
    ///
    /// Returns whether it was present. Removing an absent id is a no-op.
    pub fn deregister(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            debug!("Subscriber {} deregistered", id);
        }
        removed
    }

    /// Close hook for the transport: the connection behind `id` is gone
    pub fn connection_closed(&self, id: SubscriberId) {
        if self.deregister(id) {
            info!("Subscriber {} disconnected ({} remaining)", id, self.len());
        }
    }

    /// Point-in-time view ordered by subscriber id
    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.read().values().cloned().collect()
    }

    /// Check whether `id` is currently registered
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().contains_key(&id)
    }

    /// Number of registered subscribers
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}
