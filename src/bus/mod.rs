//! Event bus for propagating domain events between services.
//!
//! This module contains:
//! - `EventBus` trait: publish and subscribe by routing key
//! - `EventHandler` trait: idempotent processing of one event
//! - `dispatch`: the decode → handle → acknowledge policy shared by all buses
//! - Implementations: AMQP (RabbitMQ) and an in-process broadcast channel
//!
//! Delivery is at-least-once and acknowledgment is unconditional: poison
//! messages and failed handlers are logged and dropped, never requeued.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument};

use crate::{events::DomainEvent, metrics::Metrics};

pub mod amqp;
pub mod channel;

pub use amqp::{AmqpEventBus, BrokerConfig, BrokerConnection, ConnectionState};
pub use channel::ChannelEventBus;

/// Result type for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The retry budget ran out; fatal for consumers
    #[error("Broker unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: usize, message: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Subscription for '{0}' stopped")]
    SubscriptionEnded(String),
}

/// Processes events delivered for one routing key. Must tolerate duplicate
/// and out-of-order delivery across entities.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> crate::error::Result<()>;
}

/// Topic-based publish/subscribe channel
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to every queue bound to its routing key
    async fn publish(&self, event: &DomainEvent) -> Result<()>;

    /// Bind a queue for `routing_key` and start consuming into `handler`.
    /// The binding exists before this returns, so no event published
    /// afterwards can be missed.
    async fn subscribe(
        &self,
        routing_key: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle>;

    async fn health_check(&self) -> Result<()>;
}

/// A running consumer task
pub struct SubscriptionHandle {
    routing_key: String,
    queue: String,
    task: JoinHandle<Result<()>>,
}

impl SubscriptionHandle {
    pub fn new(routing_key: impl Into<String>, queue: impl Into<String>, task: JoinHandle<Result<()>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            queue: queue.into(),
            task,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop consuming
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Wait for the consumer to stop. Consumers only stop on their own
    /// when the broker is gone for good.
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(BusError::SubscriptionEnded(format!(
                "{} ({})",
                self.routing_key, e
            ))),
        }
    }
}

/// What happened to one delivery. Every outcome is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Handled,
    HandlerFailed,
    Dropped,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Handled => "handled",
            DeliveryOutcome::HandlerFailed => "handler_failed",
            DeliveryOutcome::Dropped => "dropped",
        }
    }
}

/// Decode a delivery and run its handler
pub async fn dispatch(
    routing_key: &str,
    data: &[u8],
    handler: &dyn EventHandler,
    metrics: &Metrics,
) -> DeliveryOutcome {
    let outcome = match DomainEvent::decode(data) {
        Ok(event) => {
            debug!(
                routing_key = %routing_key,
                entity_id = %event.entity_id(),
                handler = handler.name(),
                "Received event"
            );

            let span = tracing::info_span!("bus.consume", routing_key = %routing_key, entity_id = %event.entity_id());
            match handler.handle(&event).instrument(span).await {
                Ok(()) => DeliveryOutcome::Handled,
                Err(e) => {
                    error!(
                        routing_key = %routing_key,
                        entity_id = %event.entity_id(),
                        handler = handler.name(),
                        error = %e,
                        "Handler failed, dropping event"
                    );
                    DeliveryOutcome::HandlerFailed
                }
            }
        }
        Err(e) => {
            warn!(routing_key = %routing_key, error = %e, "Failed to decode event, dropping message");
            DeliveryOutcome::Dropped
        }
    };

    metrics.record_delivery(routing_key, outcome.as_str());
    outcome
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more
pub fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            words_match(&pattern[1..], key) || (!key.is_empty() && words_match(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => words_match(&pattern[1..], &key[1..]),
        (Some(word), Some(part)) if word == part => words_match(&pattern[1..], &key[1..]),
        _ => false,
    }
}
