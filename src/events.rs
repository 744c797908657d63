//! Pin change notifications.
//!
//! The scheduler owns one [`EventBus`]; anything that renders or mirrors pins
//! subscribes to it. Events are published from the scheduling context only.

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::Pin;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinEvent {
    PinAdded(Pin),
    /// Index the pin occupied before removal.
    PinRemoved(usize),
    PinChanged(Pin),
    PinsChanged(Vec<Pin>),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PinEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PinEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: PinEvent) {
        if self.tx.send(event).is_err() {
            trace!("Pin event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
