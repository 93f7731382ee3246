//! In-process event bus over a tokio broadcast channel.
//!
//! Mirrors the topic exchange semantics of the AMQP bus: every subscription
//! gets its own receiver, so each one sees every matching event. Used for
//! single-process deployments and tests.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use super::{dispatch, routing_key_matches, BusError, EventBus, EventHandler, Result, SubscriptionHandle};
use crate::{events::DomainEvent, metrics::Metrics};

/// Default channel capacity
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Envelope {
    routing_key: String,
    data: Arc<Vec<u8>>,
}

/// Event bus backed by a broadcast channel
pub struct ChannelEventBus {
    sender: broadcast::Sender<Envelope>,
    metrics: Arc<Metrics>,
}

impl ChannelEventBus {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, metrics)
    }

    pub fn with_capacity(capacity: usize, metrics: Arc<Metrics>) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, metrics }
    }

    /// Publish raw bytes under a routing key, bypassing event encoding
    pub fn publish_raw(&self, routing_key: &str, data: Vec<u8>) -> Result<()> {
        let envelope = Envelope {
            routing_key: routing_key.to_string(),
            data: Arc::new(data),
        };

        // A send without receivers is a publish to an exchange with no
        // bound queues; the message is discarded.
        match self.sender.send(envelope) {
            Ok(receivers) => debug!(routing_key = %routing_key, receivers, "Published event"),
            Err(_) => debug!(routing_key = %routing_key, "No subscribers for event"),
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    async fn publish(&self, event: &DomainEvent) -> Result<()> {
        let data = event
            .encode()
            .map_err(|e| BusError::Publish(format!("Failed to encode event: {}", e)))?;
        self.publish_raw(event.routing_key(), data)?;
        self.metrics.record_publish(event.routing_key(), "ok");
        Ok(())
    }

    async fn subscribe(
        &self,
        routing_key: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle> {
        // Subscribe before spawning so the binding exists when we return
        let mut receiver = self.sender.subscribe();
        let pattern = routing_key.to_string();
        let metrics = self.metrics.clone();
        let queue = format!("channel.{}", uuid::Uuid::new_v4());

        info!(routing_key = %routing_key, queue = %queue, handler = handler.name(), "Consuming events");

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if routing_key_matches(&pattern, &envelope.routing_key) {
                            dispatch(&envelope.routing_key, &envelope.data, handler.as_ref(), &metrics)
                                .await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(routing_key = %pattern, skipped, "Subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => {
                        debug!(routing_key = %pattern, "Channel closed, subscription ending");
                        return Ok(());
                    }
                }
            }
        });

        Ok(SubscriptionHandle::new(routing_key, queue, task))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
