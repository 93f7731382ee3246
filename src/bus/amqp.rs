//! AMQP (RabbitMQ) event bus implementation.
//!
//! Publishes to a topic exchange keyed by the event's routing key. Every
//! subscription owns an exclusive, auto-deleted queue, so each process
//! receives every matching event; running two replicas of one service
//! processes each event twice.

use async_trait::async_trait;
use backon::{BackoffBuilder, ConstantBuilder};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{dispatch, BusError, EventBus, EventHandler, Result, SubscriptionHandle};
use crate::{config::MessagingSettings, events::DomainEvent, metrics::Metrics};

/// Upper bound on a request path waiting for the broker
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker connection configuration
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672)
    pub url: String,
    /// Topic exchange shared by all services
    pub exchange: String,
    /// Connection attempts before giving up
    pub connect_retries: usize,
    /// Fixed pause between attempts
    pub retry_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from(&MessagingSettings::default())
    }
}

impl From<&MessagingSettings> for BrokerConfig {
    fn from(settings: &MessagingSettings) -> Self {
        Self {
            url: settings.url.clone(),
            exchange: settings.exchange.clone(),
            connect_retries: settings.connect_retries.max(1),
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }
}

/// Lifecycle of the process-wide broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Owns the broker connection and all reconnection logic. Publishers and
/// consumers share one instance and ask it for channels.
pub struct BrokerConnection {
    config: BrokerConfig,
    state: AtomicU8,
    // Held across reconnects so concurrent callers wait for one attempt
    connection: Mutex<Option<Connection>>,
}

impl BrokerConnection {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn exchange(&self) -> &str {
        &self.config.exchange
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Connect if not already connected, using the fixed retry budget
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.connection.lock().await;
        self.ensure_connected(&mut slot).await
    }

    /// Open a channel, reconnecting first if the connection dropped
    pub async fn channel(&self) -> Result<Channel> {
        let mut slot = self.connection.lock().await;
        self.ensure_connected(&mut slot).await?;

        let conn = slot
            .as_ref()
            .ok_or_else(|| BusError::Connection("No broker connection".to_string()))?;
        match conn.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                warn!(error = %e, "Failed to create channel, reconnecting");
                *slot = None;
                self.set_state(ConnectionState::Disconnected);
                self.ensure_connected(&mut slot).await?;

                let conn = slot
                    .as_ref()
                    .ok_or_else(|| BusError::Connection("No broker connection".to_string()))?;
                conn.create_channel()
                    .await
                    .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
            }
        }
    }

    /// Drop the shared connection only if the broker closed it. A live
    /// connection is kept for the other publishers and consumers even when a
    /// single channel died. Returns whether the connection was dropped.
    pub async fn discard_if_closed(&self) -> bool {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|conn| conn.status().connected()) {
            return false;
        }
        *slot = None;
        self.set_state(ConnectionState::Disconnected);
        true
    }

    pub async fn close(&self) {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.take() {
            if let Err(e) = conn.close(200, "shutting down").await {
                debug!(error = %e, "Error while closing broker connection");
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn ensure_connected(&self, slot: &mut Option<Connection>) -> Result<()> {
        if let Some(conn) = slot.as_ref() {
            if conn.status().connected() {
                return Ok(());
            }
            warn!(url = %self.config.url, "Broker connection lost");
        }

        *slot = None;
        self.set_state(ConnectionState::Connecting);

        let attempts = self.config.connect_retries.max(1);
        let delays = ConstantBuilder::default()
            .with_delay(self.config.retry_delay)
            .with_max_times(attempts - 1)
            .build();

        let mut last_error = String::new();
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(delays).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self.connect_once().await {
                Ok(conn) => {
                    info!(
                        exchange = %self.config.exchange,
                        url = %self.config.url,
                        attempt = attempt + 1,
                        "Connected to broker"
                    );
                    *slot = Some(conn);
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Failed to connect to broker"
                    );
                    last_error = e.to_string();
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        Err(BusError::Unavailable {
            attempts,
            message: last_error,
        })
    }

    async fn connect_once(&self) -> std::result::Result<Connection, lapin::Error> {
        let conn = Connection::connect(&self.config.url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;
        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(conn)
    }
}

/// RabbitMQ-backed event bus
pub struct AmqpEventBus {
    connection: Arc<BrokerConnection>,
    publish_channel: Mutex<Option<Channel>>,
    metrics: Arc<Metrics>,
}

impl AmqpEventBus {
    pub fn new(connection: Arc<BrokerConnection>, metrics: Arc<Metrics>) -> Self {
        Self {
            connection,
            publish_channel: Mutex::new(None),
            metrics,
        }
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    async fn publish_inner(&self, routing_key: &str, payload: &[u8], event_timestamp: u64) -> Result<()> {
        let mut slot = self.publish_channel.lock().await;
        let channel = match slot.as_ref() {
            Some(channel) if channel.status().connected() => channel.clone(),
            _ => {
                let channel = self.connection.channel().await?;
                *slot = Some(channel.clone());
                channel
            }
        };

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_timestamp(event_timestamp);

        let confirm = channel
            .basic_publish(
                self.connection.exchange(),
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await;

        match confirm {
            Ok(confirm) => confirm.await.map(|_| ()).map_err(|e| {
                *slot = None;
                BusError::Publish(format!("Publish confirmation failed: {}", e))
            }),
            Err(e) => {
                *slot = None;
                Err(BusError::Publish(format!("Failed to publish: {}", e)))
            }
        }
    }

    /// Declare an exclusive queue, bind it and start a consumer on it
    async fn bind_consumer(
        connection: &BrokerConnection,
        routing_key: &str,
    ) -> Result<(String, Consumer)> {
        let channel = connection.channel().await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;
        let queue_name = queue.name().as_str().to_string();

        channel
            .queue_bind(
                &queue_name,
                connection.exchange(),
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        let consumer = channel
            .basic_consume(
                &queue_name,
                &format!("eventgate-{}", uuid::Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue_name, routing_key = %routing_key, "Bound queue to exchange");
        Ok((queue_name, consumer))
    }

    /// Consume until the broker is gone for good. A dropped stream triggers
    /// a reconnect and a fresh queue; exhausting the retry budget ends the
    /// task with an error.
    async fn consume_loop(
        connection: Arc<BrokerConnection>,
        routing_key: String,
        handler: Arc<dyn EventHandler>,
        metrics: Arc<Metrics>,
        mut consumer: Consumer,
    ) -> Result<()> {
        loop {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        dispatch(
                            delivery.routing_key.as_str(),
                            &delivery.data,
                            handler.as_ref(),
                            &metrics,
                        )
                        .await;

                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            error!(error = %e, routing_key = %routing_key, "Failed to ack message");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, routing_key = %routing_key, "Consumer delivery error, will reconnect");
                        break;
                    }
                }
            }

            let dropped = connection.discard_if_closed().await;
            warn!(routing_key = %routing_key, connection_lost = dropped, "Consumer stream ended, re-subscribing");

            match Self::bind_consumer(&connection, &routing_key).await {
                Ok((queue, next)) => {
                    info!(queue = %queue, routing_key = %routing_key, "Consumer re-subscribed");
                    consumer = next;
                }
                Err(e) => {
                    error!(error = %e, routing_key = %routing_key, "Giving up on subscription");
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for AmqpEventBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(routing_key = %event.routing_key()))]
    async fn publish(&self, event: &DomainEvent) -> Result<()> {
        let payload = event
            .encode()
            .map_err(|e| BusError::Publish(format!("Failed to encode event: {}", e)))?;

        let result = match tokio::time::timeout(
            PUBLISH_TIMEOUT,
            self.publish_inner(
                event.routing_key(),
                &payload,
                event.emitted_at().timestamp().max(0) as u64,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BusError::Publish(format!(
                "Timed out after {}s",
                PUBLISH_TIMEOUT.as_secs()
            ))),
        };

        match &result {
            Ok(()) => {
                debug!(
                    exchange = %self.connection.exchange(),
                    entity_id = %event.entity_id(),
                    "Published event"
                );
                self.metrics.record_publish(event.routing_key(), "ok");
            }
            Err(_) => self.metrics.record_publish(event.routing_key(), "error"),
        }
        result
    }

    async fn subscribe(
        &self,
        routing_key: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle> {
        let (queue, consumer) = Self::bind_consumer(&self.connection, routing_key).await?;

        let task = tokio::spawn(Self::consume_loop(
            self.connection.clone(),
            routing_key.to_string(),
            handler.clone(),
            self.metrics.clone(),
            consumer,
        ));

        info!(
            routing_key = %routing_key,
            queue = %queue,
            handler = handler.name(),
            "Consuming events"
        );
        Ok(SubscriptionHandle::new(routing_key, queue, task))
    }

    async fn health_check(&self) -> Result<()> {
        match self.connection.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(BusError::Connection(format!("Broker is {:?}", state))),
        }
    }
}


/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test amqp_integration -- --ignored
#[cfg(test)]
mod amqp_integration {
    use super::*;
    use crate::events::{PostCreated, POST_CREATED};
    use tokio::sync::mpsc;

    struct ForwardingHandler {
        tx: mpsc::Sender<DomainEvent>,
    }

    #[async_trait]
    impl EventHandler for ForwardingHandler {
        fn name(&self) -> &str {
            "forwarding"
        }

        async fn handle(&self, event: &DomainEvent) -> crate::error::Result<()> {
            let _ = self.tx.send(event.clone()).await;
            Ok(())
        }
    }

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_publish_and_consume() {
        let connection = Arc::new(BrokerConnection::new(BrokerConfig {
            url: amqp_url(),
            exchange: format!("test_events_{}", uuid::Uuid::new_v4()),
            connect_retries: 3,
            retry_delay: Duration::from_millis(200),
        }));
        connection.connect().await.expect("Failed to connect");

        let metrics = Arc::new(Metrics::new().unwrap());
        let bus = AmqpEventBus::new(connection.clone(), metrics);

        let (tx, mut rx) = mpsc::channel(10);
        let handle = bus
            .subscribe(POST_CREATED, Arc::new(ForwardingHandler { tx }))
            .await
            .expect("Failed to subscribe");
        assert!(handle.queue().starts_with("amq.gen-"));

        let event = DomainEvent::new(&PostCreated {
            post_id: "p1".to_string(),
            user_id: "u1".to_string(),
            content: "hi".to_string(),
            created_at: chrono::Utc::now(),
        })
        .unwrap();
        bus.publish(&event).await.expect("Failed to publish");

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for message")
            .expect("Channel closed");
        assert_eq!(received, event);

        // A healthy connection survives a consumer asking to discard it
        assert!(!connection.discard_if_closed().await);
        assert_eq!(connection.state(), ConnectionState::Connected);

        handle.cancel();
        connection.close().await;
    }
}
