//! Room event bus
//!
//! Typed publish/subscribe used by transports to hand work to a room's
//! coordinator. Delivery never blocks the publisher: a subscriber whose
//! queue is full simply misses the event.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::participant::Participant;

/// Discriminant used to subscribe to one class of events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Register,
    Unregister,
    Broadcast,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register => write!(f, "register"),
            Self::Unregister => write!(f, "unregister"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// An event published into a room
#[derive(Clone)]
pub enum Event {
    /// A participant joins the room
    Register(Arc<Participant>),
    /// A participant's transport is gone
    Unregister(Arc<Participant>),
    /// A raw frame received from a participant
    Broadcast {
        sender: Arc<Participant>,
        payload: Bytes,
    },
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Register(_) => EventKind::Register,
            Self::Unregister(_) => EventKind::Unregister,
            Self::Broadcast { .. } => EventKind::Broadcast,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register(p) => f.debug_tuple("Register").field(p.session()).finish(),
            Self::Unregister(p) => f.debug_tuple("Unregister").field(p.session()).finish(),
            Self::Broadcast { sender, payload } => f
                .debug_struct("Broadcast")
                .field("sender", sender.session())
                .field("len", &payload.len())
                .finish(),
        }
    }
}

/// Cloneable handle to a room's event bus
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<EventKind, Vec<mpsc::Sender<Event>>>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new bounded queue for `kind` and return its receiving end
    pub fn subscribe(&self, kind: EventKind, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribe_with(kind, tx);
        rx
    }

    /// Register an existing queue for `kind`
    pub fn subscribe_with(&self, kind: EventKind, sender: mpsc::Sender<Event>) {
        self.subscribers.write().entry(kind).or_default().push(sender);
    }

    /// Deliver `event` to every subscriber of its kind.
    ///
    /// Returns how many subscribers received it. Full queues drop the event;
    /// closed queues are pruned.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        let mut closed = false;

        {
            let subscribers = self.subscribers.read();
            let Some(queues) = subscribers.get(&kind) else {
                debug!(event_type = %kind, "No subscribers for event");
                return 0;
            };

            for queue in queues {
                match queue.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(event_type = %kind, "Subscriber queue full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed = true,
                }
            }
        }

        if closed {
            if let Some(queues) = self.subscribers.write().get_mut(&kind) {
                queues.retain(|queue| !queue.is_closed());
            }
            debug!(event_type = %kind, "Pruned closed subscriber queues");
        }

        delivered
    }

    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.read().get(&kind).map_or(0, Vec::len)
    }
}
