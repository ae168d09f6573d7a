/*!
 * Event bus for Bellatrix.
 *
 * A typed broadcast bus used to deliver notifications (device discovered,
 * telemetry updated, console output, script progress) to any number of
 * callers. Each subscriber sees events in publication order.
 */
use std::fmt::Debug;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Default number of events buffered per subscriber
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Receiving half of an event bus subscription
pub type EventReceiver<E> = broadcast::Receiver<E>;

/// Event bus for publishing and subscribing to events of one type
#[derive(Debug)]
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
    capacity: usize,
}

impl<E: Clone + Debug + Send + 'static> EventBus<E> {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity: capacity.max(1) }
    }

    /// Publish an event, returning the number of subscribers that received it
    ///
    /// Publishing without subscribers is not an error; the event is dropped.
    pub fn publish(&self, event: E) -> usize {
        match self.sender.send(event) {
            Ok(n) => {
                trace!("Published event to {} receivers", n);
                n
            }
            Err(_) => 0,
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> EventReceiver<E> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Channel capacity per subscriber
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<E: Clone + Debug + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared event bus that can be cloned
#[derive(Debug)]
pub struct SharedEventBus<E>(Arc<EventBus<E>>);

impl<E> Clone for SharedEventBus<E> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<E: Clone + Debug + Send + 'static> SharedEventBus<E> {
    /// Create a new shared event bus
    pub fn new() -> Self {
        Self(Arc::new(EventBus::new()))
    }

    /// Create a new shared event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Arc::new(EventBus::with_capacity(capacity)))
    }

    /// Publish an event
    pub fn publish(&self, event: E) -> usize {
        self.0.publish(event)
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventReceiver<E> {
        self.0.subscribe()
    }

    /// Get a reference to the underlying bus
    pub fn bus(&self) -> &EventBus<E> {
        &self.0
    }
}

impl<E: Clone + Debug + Send + 'static> Default for SharedEventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive the next event, skipping over a lag gap instead of failing
///
/// Returns an error only once the bus itself has been dropped.
pub async fn recv_skipping_lag<E: Clone>(rx: &mut EventReceiver<E>) -> Result<E> {
    loop {
        match rx.recv().await {
            Ok(event) => return Ok(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event subscriber lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(Error::event("Event bus closed"));
            }
        }
    }
}
