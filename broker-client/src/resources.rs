//! Declarative broker resource descriptors.
//!
//! Each descriptor describes a piece of broker topology and needs an explicit
//! asynchronous `declare()` before it takes effect.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::connection::Channel;
use crate::error::{ClientError, Result};
use crate::types::{ConsumerTag, ExchangeType, MessageHandler, OutboundMessage, PublishOptions};

/// An exchange: the broker entity that routes published messages to bound queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// Exchange name
    pub name: String,
    /// Routing behaviour
    pub kind: ExchangeType,
    /// Survives broker restarts
    pub durable: bool,
    /// Deleted once the last binding is removed
    pub auto_delete: bool,
    /// Messages published through this exchange are marked persistent
    pub persistent: bool,
}

impl Exchange {
    /// Create a durable, non-auto-deleting exchange with persistent delivery.
    pub fn new(name: impl Into<String>, kind: ExchangeType) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
            persistent: true,
        }
    }

    /// Create a durable topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeType::Topic)
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Declare the exchange on a channel.
    pub async fn declare(&self, channel: &dyn Channel) -> Result<()> {
        channel.declare_exchange(self).await
    }
}

/// A queue bound to an exchange with a routing-key pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    /// Queue name
    pub name: String,
    /// Binding key used when binding the queue to its exchange
    pub routing_key: String,
    /// Exchange the queue is bound to
    pub exchange: Exchange,
    /// Usable only by the channel that declared it
    pub exclusive: bool,
    /// Deleted when its last consumer is cancelled
    pub auto_delete: bool,
    /// Survives broker restarts
    pub durable: bool,
}

impl Queue {
    /// Create a durable, shared queue bound to `exchange` with `routing_key`.
    pub fn new(name: impl Into<String>, routing_key: impl Into<String>, exchange: Exchange) -> Self {
        Self {
            name: name.into(),
            routing_key: routing_key.into(),
            exchange,
            exclusive: false,
            auto_delete: false,
            durable: true,
        }
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Declare the queue (and its binding) on a channel.
    pub async fn declare(&self, channel: &dyn Channel) -> Result<()> {
        channel.declare_queue(self).await
    }
}

/// Publishing handle bound to an exchange.
pub struct Producer {
    channel: Arc<dyn Channel>,
    exchange: Exchange,
    routing_key: Option<String>,
}

impl Producer {
    /// Create a producer publishing to `exchange` over `channel`.
    pub fn new(channel: Arc<dyn Channel>, exchange: Exchange, routing_key: Option<String>) -> Self {
        Self {
            channel,
            exchange,
            routing_key,
        }
    }

    /// Declare the producer's exchange.
    pub async fn declare(&self) -> Result<()> {
        self.exchange.declare(self.channel.as_ref()).await
    }

    /// Prepare a publish with per-message options.
    ///
    /// The routing key is taken from `options`, then from the producer's default,
    /// then falls back to the empty key.
    pub fn route(&self, options: PublishOptions) -> Route<'_> {
        let routing_key = options
            .routing_key
            .clone()
            .or_else(|| self.routing_key.clone())
            .unwrap_or_default();

        Route {
            producer: self,
            routing_key,
            options,
        }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("channel", &self.channel.id())
            .field("exchange", &self.exchange.name)
            .field("routing_key", &self.routing_key)
            .finish()
    }
}

/// A publish prepared by [`Producer::route`].
pub struct Route<'a> {
    producer: &'a Producer,
    routing_key: String,
    options: PublishOptions,
}

impl Route<'_> {
    /// The routing key this route publishes with.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Publish a body on this route.
    pub async fn publish<B: Into<Bytes>>(self, body: B) -> Result<()> {
        let message = OutboundMessage {
            body: body.into(),
            headers: self.options.headers,
            content_type: self.options.content_type,
            persistent: self.producer.exchange.persistent,
        };

        self.producer
            .channel
            .publish(&self.producer.exchange.name, &self.routing_key, message)
            .await
    }
}

/// A consumer reading from one or more queues over its own channel.
pub struct Consumer {
    channel: Arc<dyn Channel>,
    queues: Vec<Queue>,
    no_ack: bool,
    handler: MessageHandler,
    tags: Mutex<Vec<ConsumerTag>>,
}

impl Consumer {
    /// Create a consumer. Nothing happens on the broker until `declare()` and `consume()`.
    pub fn new(channel: Arc<dyn Channel>, queues: Vec<Queue>, no_ack: bool, handler: MessageHandler) -> Self {
        Self {
            channel,
            queues,
            no_ack,
            handler,
            tags: Mutex::new(Vec::new()),
        }
    }

    /// Declare every queue along with the exchange it binds to.
    pub async fn declare(&self) -> Result<()> {
        for queue in &self.queues {
            queue.exchange.declare(self.channel.as_ref()).await?;
            queue.declare(self.channel.as_ref()).await?;
        }
        Ok(())
    }

    /// Start consuming from every queue.
    pub async fn consume(&self) -> Result<()> {
        for queue in &self.queues {
            let tag = self
                .channel
                .consume(&queue.name, self.no_ack, Arc::clone(&self.handler))
                .await?;
            tracing::debug!("Consumer {} started on queue {}", tag, queue.name);
            self.tags.lock().push(tag);
        }
        Ok(())
    }

    /// Cancel every started consumer.
    ///
    /// All tags are attempted even if one fails; the first failure is returned.
    pub async fn cancel(&self) -> Result<()> {
        let tags = std::mem::take(&mut *self.tags.lock());
        let mut first_error: Option<ClientError> = None;

        for tag in tags {
            if let Err(e) = self.channel.cancel(&tag).await {
                tracing::debug!("Failed to cancel consumer {}: {}", tag, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The channel this consumer owns.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// Tags of the consumers currently running.
    pub fn tags(&self) -> Vec<ConsumerTag> {
        self.tags.lock().clone()
    }

    pub fn is_consuming(&self) -> bool {
        !self.tags.lock().is_empty()
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("channel", &self.channel.id())
            .field("queues", &self.queues.iter().map(|q| q.name.as_str()).collect::<Vec<_>>())
            .field("no_ack", &self.no_ack)
            .field("tags", &*self.tags.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::memory::{MemoryBroker, MemoryConnection};
    use tokio::sync::mpsc;

    async fn connected() -> (MemoryBroker, MemoryConnection) {
        let broker = MemoryBroker::new();
        let connection = MemoryConnection::new(broker.clone());
        connection.connect().await.unwrap();
        (broker, connection)
    }

    #[test]
    fn test_exchange_defaults() {
        let exchange = Exchange::topic("events");
        assert_eq!(exchange.kind, ExchangeType::Topic);
        assert!(exchange.durable);
        assert!(!exchange.auto_delete);
        assert!(exchange.persistent);
    }

    #[test]
    fn test_queue_builder() {
        let queue = Queue::new("q", "a.#", Exchange::topic("events"))
            .with_exclusive(true)
            .with_auto_delete(true)
            .with_durable(false);
        assert!(queue.exclusive);
        assert!(queue.auto_delete);
        assert!(!queue.durable);
        assert_eq!(queue.routing_key, "a.#");
    }

    #[tokio::test]
    async fn test_route_routing_key_precedence() {
        let (_broker, connection) = connected().await;
        let producer = Producer::new(
            connection.channel(),
            Exchange::topic("events"),
            Some("default.key".to_string()),
        );

        assert_eq!(producer.route(PublishOptions::new()).routing_key(), "default.key");
        assert_eq!(
            producer
                .route(PublishOptions::new().with_routing_key("explicit"))
                .routing_key(),
            "explicit"
        );

        let keyless = Producer::new(connection.channel(), Exchange::topic("events"), None);
        assert_eq!(keyless.route(PublishOptions::new()).routing_key(), "");
    }

    #[tokio::test]
    async fn test_consumer_declare_consume_cancel() {
        let (broker, connection) = connected().await;
        let exchange = Exchange::topic("events");
        let producer = Producer::new(connection.channel(), exchange.clone(), None);
        producer.declare().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |message| {
            let _ = tx.send(message);
        });
        let queue = Queue::new("q-orders", "orders.*", exchange)
            .with_exclusive(true)
            .with_auto_delete(true)
            .with_durable(false);
        let consumer = Consumer::new(connection.channel(), vec![queue], true, handler);

        consumer.declare().await.unwrap();
        consumer.consume().await.unwrap();
        assert!(consumer.is_consuming());

        producer
            .route(PublishOptions::new().with_routing_key("orders.created"))
            .publish("hello")
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.body_str(), Some("hello"));
        assert_eq!(message.routing_key, "orders.created");
        assert!(message.persistent);

        consumer.cancel().await.unwrap();
        assert!(!consumer.is_consuming());
        // Auto-delete queue disappears with its last consumer
        assert!(!broker.queue_exists("q-orders"));
    }
}
