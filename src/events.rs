use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Events emitted by the payment engine as order state changes land.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Cash-on-delivery payment registered; collection happens at handover.
    PaymentPending(Uuid),
    PaymentCompleted(Uuid),
    PaymentFailed(Uuid),
    PaymentRefunded(Uuid),
}

impl Event {
    pub fn order_id(&self) -> Uuid {
        match self {
            Event::PaymentPending(id)
            | Event::PaymentCompleted(id)
            | Event::PaymentFailed(id)
            | Event::PaymentRefunded(id) => *id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::PaymentPending(_) => "payment_pending",
            Event::PaymentCompleted(_) => "payment_completed",
            Event::PaymentFailed(_) => "payment_failed",
            Event::PaymentRefunded(_) => "payment_refunded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Background consumer draining the event channel.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        info!(
            event = event.name(),
            order_id = %event.order_id(),
            "processing event"
        );
    }
    debug!("event channel closed; consumer shutting down");
}
