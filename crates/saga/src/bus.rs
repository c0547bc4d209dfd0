//! At-least-once event bus between saga steps.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, SagaError};

/// Topic carrying [`crate::model::CheckoutEvent`] payloads to the pre-freeze step.
pub const CHECKOUT_TOPIC: &str = "order.checkout";

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub topic: String,
    /// Idempotency key of the message (the preorder id for checkout events).
    pub key: String,
    pub payload: serde_json::Value,
    /// Deliveries attempted so far.
    pub attempts: u32,
}

impl BusMessage {
    /// Creates a message with a JSON payload.
    pub fn new<T: Serialize>(topic: &str, key: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            key: key.into(),
            payload: serde_json::to_value(payload)?,
            attempts: 0,
        })
    }

    /// Decodes the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Returns the message marked for another delivery.
    pub fn redelivery(mut self) -> Self {
        self.attempts += 1;
        self
    }
}

/// Publishes messages for asynchronous consumers.
///
/// Delivery is at-least-once and may reorder messages.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes a message.
    async fn publish(&self, message: BusMessage) -> Result<()>;
}

/// In-process bus backed by an unbounded channel.
#[derive(Clone)]
pub struct InMemoryEventBus {
    sender: mpsc::UnboundedSender<BusMessage>,
}

/// Receiving end of an [`InMemoryEventBus`].
pub type BusReceiver = mpsc::UnboundedReceiver<BusMessage>;

impl InMemoryEventBus {
    /// Creates a bus and the receiver its consumer reads from.
    pub fn channel() -> (Self, BusReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        tracing::debug!(topic = %message.topic, key = %message.key, "Message published");
        self.sender
            .send(message)
            .map_err(|e| SagaError::Messaging(format!("bus closed: {}", e.0.id)))
    }
}
