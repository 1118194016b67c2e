//! Notification hub for custody events
//!
//! Services enqueue events after a successful write; delivery to connected
//! clients is best effort. Emitting never fails, even with no subscribers.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::db::models::{OfferId, PropertyId, TransferId, TransferStatus, UserId};

/// Events pushed to connected clients
#[derive(Debug, Clone, PartialEq)]
pub enum HandReceiptEvent {
    // Transfer events
    TransferCreated {
        transfer_id: TransferId,
        property_id: PropertyId,
        from_user_id: UserId,
        to_user_id: UserId,
    },
    TransferUpdated {
        transfer_id: TransferId,
        status: TransferStatus,
        from_user_id: UserId,
        to_user_id: UserId,
    },

    // Broadcast offer events
    OfferCreated {
        offer_id: OfferId,
        property_id: PropertyId,
        recipient_ids: Vec<UserId>,
    },
    OfferAccepted {
        offer_id: OfferId,
        transfer_id: TransferId,
        accepted_by: UserId,
    },
    OfferCancelled {
        offer_id: OfferId,
    },

    // Property events
    PropertyCreated {
        property_id: PropertyId,
        serial_number: String,
    },
    PropertyUpdated {
        property_id: PropertyId,
    },
    PropertiesImported {
        user_id: UserId,
        count: usize,
    },
    ComponentAttached {
        parent_property_id: PropertyId,
        component_property_id: PropertyId,
    },
    ComponentDetached {
        parent_property_id: PropertyId,
        component_property_id: PropertyId,
    },

    // Connection events
    ConnectionRequested {
        connection_id: i64,
        requester_id: UserId,
        addressee_id: UserId,
    },
    ConnectionAccepted {
        connection_id: i64,
        requester_id: UserId,
        addressee_id: UserId,
    },

    // Document events
    DocumentReceived {
        document_id: i64,
        user_id: UserId,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &HandReceiptEvent);
}

/// Broadcast hub for custody events
pub struct EventBus {
    sender: broadcast::Sender<HandReceiptEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: HandReceiptEvent) {
        trace!(event = ?event, "Emitting hand receipt event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HandReceiptEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs custody-relevant events at info, everything else at trace
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &HandReceiptEvent) {
        match event {
            HandReceiptEvent::TransferUpdated {
                transfer_id,
                status,
                from_user_id,
                to_user_id,
            } => {
                info!(
                    transfer_id,
                    status = %status,
                    from = from_user_id,
                    to = to_user_id,
                    "Transfer updated"
                );
            }
            HandReceiptEvent::OfferAccepted {
                offer_id,
                transfer_id,
                accepted_by,
            } => {
                info!(offer_id, transfer_id, accepted_by, "Offer accepted");
            }
            HandReceiptEvent::PropertiesImported { user_id, count } => {
                info!(user_id, count, "Properties imported");
            }
            _ => {
                trace!(event = ?event, "Hand receipt event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
