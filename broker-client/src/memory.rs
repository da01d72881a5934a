//! In-process topic broker.
//!
//! `MemoryBroker` keeps exchanges, bindings, queues and consumers in memory and
//! implements the [`Connection`]/[`Channel`] contract through
//! [`MemoryConnection`]. It backs `memory://` URIs and doubles as the test
//! transport: operations can be delayed or failed on demand, and counters
//! record how many resources were declared, started and torn down.
//!
//! Each consumer delivers from its own task, in publish order. There is no
//! acknowledgement or redelivery: every delivery is treated as auto-acked.
//! Direct, fanout and topic exchanges are routed; declaring a headers exchange
//! fails with [`ClientError::Unsupported`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::connection::{Channel, Connection};
use crate::error::{ClientError, Result};
use crate::resources::{Exchange, Queue};
use crate::topic;
use crate::types::{ChannelId, ConsumerTag, ExchangeType, Message, MessageHandler, OutboundMessage};

/// Capacity of the connection error broadcast channel
const ERROR_CHANNEL_CAPACITY: usize = 16;

static NAMED_BROKERS: OnceLock<Mutex<HashMap<String, MemoryBroker>>> = OnceLock::new();

/// Broker operations that can be delayed or failed by the test hooks.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Operation {
    Connect,
    DeclareExchange,
    DeclareQueue,
    Publish,
    Consume,
    Cancel,
    CloseChannel,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Connect => "connect",
            Operation::DeclareExchange => "declare_exchange",
            Operation::DeclareQueue => "declare_queue",
            Operation::Publish => "publish",
            Operation::Consume => "consume",
            Operation::Cancel => "cancel",
            Operation::CloseChannel => "close_channel",
        };
        f.write_str(name)
    }
}

/// Snapshot of the broker's activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub exchanges_declared: usize,
    pub queues_declared: usize,
    pub consumers_started: usize,
    pub consumers_cancelled: usize,
    pub channels_opened: usize,
    pub channels_closed: usize,
    pub messages_published: usize,
    pub messages_delivered: usize,
}

#[derive(Debug, Default)]
struct Counters {
    exchanges_declared: AtomicUsize,
    queues_declared: AtomicUsize,
    consumers_started: AtomicUsize,
    consumers_cancelled: AtomicUsize,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
    messages_published: AtomicUsize,
    messages_delivered: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BrokerStats {
        BrokerStats {
            exchanges_declared: self.exchanges_declared.load(Ordering::Relaxed),
            queues_declared: self.queues_declared.load(Ordering::Relaxed),
            consumers_started: self.consumers_started.load(Ordering::Relaxed),
            consumers_cancelled: self.consumers_cancelled.load(Ordering::Relaxed),
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
        }
    }
}

struct Binding {
    queue: String,
    key: String,
}

struct ExchangeEntry {
    declared: Exchange,
    bindings: Vec<Binding>,
}

/// A message waiting in a queue with no consumer attached.
struct Parked {
    exchange: String,
    routing_key: String,
    message: OutboundMessage,
}

struct ConsumerEntry {
    tag: ConsumerTag,
    channel: ChannelId,
    sender: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

struct QueueEntry {
    exclusive: bool,
    auto_delete: bool,
    durable: bool,
    owner: ChannelId,
    consumers: Vec<ConsumerEntry>,
    backlog: VecDeque<Parked>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
}

impl BrokerState {
    fn remove_queue(&mut self, name: &str) {
        if let Some(queue) = self.queues.remove(name) {
            for consumer in queue.consumers {
                consumer.task.abort();
            }
        }
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != name);
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    counters: Counters,
    faults: Mutex<HashMap<Operation, VecDeque<String>>>,
    latency: Mutex<HashMap<Operation, Duration>>,
    next_channel: AtomicU64,
    next_delivery: AtomicU64,
}

/// An in-process topic broker.
///
/// Cloning is cheap; clones share the same exchanges, queues and counters.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Create a fresh, empty broker.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                counters: Counters::default(),
                faults: Mutex::new(HashMap::new()),
                latency: Mutex::new(HashMap::new()),
                next_channel: AtomicU64::new(1),
                next_delivery: AtomicU64::new(1),
            }),
        }
    }

    /// Get (or create) the process-wide broker registered under `name`.
    pub fn named(name: &str) -> Self {
        let registry = NAMED_BROKERS.get_or_init(|| Mutex::new(HashMap::new()));
        registry
            .lock()
            .entry(name.to_string())
            .or_insert_with(MemoryBroker::new)
            .clone()
    }

    /// Make the next `operation` fail with an injected error.
    ///
    /// Calls queue up: three calls fail the next three attempts.
    pub fn fail_next(&self, operation: Operation, reason: impl Into<String>) {
        self.shared
            .faults
            .lock()
            .entry(operation)
            .or_default()
            .push_back(reason.into());
    }

    /// Delay every `operation` by `delay` before it takes effect.
    pub fn set_latency(&self, operation: Operation, delay: Duration) {
        self.shared.latency.lock().insert(operation, delay);
    }

    /// Remove every configured latency.
    pub fn clear_latency(&self) {
        self.shared.latency.lock().clear();
    }

    /// Current activity counters.
    pub fn stats(&self) -> BrokerStats {
        self.shared.counters.snapshot()
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.shared.state.lock().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.shared.state.lock().queues.contains_key(name)
    }

    /// Names of all queues currently declared, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of consumers attached to a queue (0 if the queue does not exist).
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Total number of consumers across all queues.
    pub fn total_consumers(&self) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .values()
            .map(|q| q.consumers.len())
            .sum()
    }

    /// Binding keys on an exchange, in declaration order.
    pub fn bindings(&self, exchange: &str) -> Vec<String> {
        self.shared
            .state
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.iter().map(|b| b.key.clone()).collect())
            .unwrap_or_default()
    }

    /// Apply configured latency, then any queued fault, for `operation`.
    async fn gate(&self, operation: Operation) -> Result<()> {
        let delay = self.shared.latency.lock().get(&operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fault = self
            .shared
            .faults
            .lock()
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front());
        match fault {
            Some(reason) => {
                tracing::debug!("Injecting failure into {}: {}", operation, reason);
                Err(ClientError::Injected {
                    operation: operation.to_string(),
                    reason,
                })
            }
            None => Ok(()),
        }
    }

    fn next_channel_id(&self) -> ChannelId {
        Counters::bump(&self.shared.counters.channels_opened);
        ChannelId::new(self.shared.next_channel.fetch_add(1, Ordering::Relaxed))
    }

    fn declare_exchange(&self, exchange: &Exchange) -> Result<()> {
        if exchange.kind == ExchangeType::Headers {
            return Err(ClientError::Unsupported(format!(
                "headers exchange '{}': routing on message headers is not supported",
                exchange.name
            )));
        }

        let mut state = self.shared.state.lock();

        if let Some(existing) = state.exchanges.get(&exchange.name) {
            let same = existing.declared.kind == exchange.kind
                && existing.declared.durable == exchange.durable
                && existing.declared.auto_delete == exchange.auto_delete;
            if !same {
                return Err(ClientError::PreconditionFailed(format!(
                    "exchange '{}' already declared with different properties",
                    exchange.name
                )));
            }
        } else {
            state.exchanges.insert(
                exchange.name.clone(),
                ExchangeEntry {
                    declared: exchange.clone(),
                    bindings: Vec::new(),
                },
            );
        }

        Counters::bump(&self.shared.counters.exchanges_declared);
        Ok(())
    }

    fn declare_queue(&self, channel: ChannelId, queue: &Queue) -> Result<()> {
        let mut state = self.shared.state.lock();

        if !state.exchanges.contains_key(&queue.exchange.name) {
            return Err(ClientError::ExchangeNotFound(queue.exchange.name.clone()));
        }

        match state.queues.get(&queue.name) {
            Some(existing) => {
                if existing.exclusive && existing.owner != channel {
                    return Err(ClientError::ResourceLocked(queue.name.clone()));
                }
                let same = existing.exclusive == queue.exclusive
                    && existing.auto_delete == queue.auto_delete
                    && existing.durable == queue.durable;
                if !same {
                    return Err(ClientError::PreconditionFailed(format!(
                        "queue '{}' already declared with different properties",
                        queue.name
                    )));
                }
            }
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    QueueEntry {
                        exclusive: queue.exclusive,
                        auto_delete: queue.auto_delete,
                        durable: queue.durable,
                        owner: channel,
                        consumers: Vec::new(),
                        backlog: VecDeque::new(),
                        next_consumer: 0,
                    },
                );
            }
        }

        if let Some(exchange) = state.exchanges.get_mut(&queue.exchange.name) {
            let already_bound = exchange
                .bindings
                .iter()
                .any(|b| b.queue == queue.name && b.key == queue.routing_key);
            if !already_bound {
                exchange.bindings.push(Binding {
                    queue: queue.name.clone(),
                    key: queue.routing_key.clone(),
                });
            }
        }

        Counters::bump(&self.shared.counters.queues_declared);
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<()> {
        let mut state = self.shared.state.lock();

        let entry = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| ClientError::ExchangeNotFound(exchange.to_string()))?;

        let mut targets: Vec<String> = entry
            .bindings
            .iter()
            .filter(|b| topic::binding_accepts(entry.declared.kind, &b.key, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        // A queue bound twice by matching keys still receives the message once.
        targets.sort();
        targets.dedup();

        Counters::bump(&self.shared.counters.messages_published);
        tracing::trace!(
            "Publishing to {} with key {} -> {} queue(s)",
            exchange,
            routing_key,
            targets.len()
        );

        for queue_name in targets {
            let Some(queue) = state.queues.get_mut(&queue_name) else {
                continue;
            };
            let parked = Parked {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message: message.clone(),
            };
            if queue.consumers.is_empty() {
                queue.backlog.push_back(parked);
            } else {
                self.deliver(queue, parked);
            }
        }

        Ok(())
    }

    /// Hand a message to the next consumer of `queue` (round robin).
    fn deliver(&self, queue: &mut QueueEntry, parked: Parked) {
        let index = queue.next_consumer % queue.consumers.len();
        queue.next_consumer = queue.next_consumer.wrapping_add(1);
        let consumer = &queue.consumers[index];

        let message = Message {
            body: parked.message.body,
            headers: parked.message.headers,
            content_type: parked.message.content_type,
            persistent: parked.message.persistent,
            exchange: parked.exchange,
            routing_key: parked.routing_key,
            delivery_tag: self.shared.next_delivery.fetch_add(1, Ordering::Relaxed),
            consumer_tag: consumer.tag.clone(),
        };

        if consumer.sender.send(message).is_ok() {
            Counters::bump(&self.shared.counters.messages_delivered);
        }
    }

    fn consume(&self, channel: ChannelId, queue_name: &str, handler: MessageHandler) -> Result<ConsumerTag> {
        let mut state = self.shared.state.lock();

        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| ClientError::QueueNotFound(queue_name.to_string()))?;
        if queue.exclusive && queue.owner != channel {
            return Err(ClientError::ResourceLocked(queue_name.to_string()));
        }

        let tag = ConsumerTag::new(format!("amq.ctag-{}", uuid::Uuid::new_v4()));
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();
        let task = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                handler(message);
            }
        });

        queue.consumers.push(ConsumerEntry {
            tag: tag.clone(),
            channel,
            sender,
            task,
        });

        let backlog: Vec<Parked> = queue.backlog.drain(..).collect();
        for parked in backlog {
            self.deliver(queue, parked);
        }

        Counters::bump(&self.shared.counters.consumers_started);
        Ok(tag)
    }

    fn cancel(&self, channel: ChannelId, tag: &ConsumerTag) -> Result<()> {
        let mut state = self.shared.state.lock();

        let location = state.queues.iter().find_map(|(name, queue)| {
            queue
                .consumers
                .iter()
                .position(|c| &c.tag == tag && c.channel == channel)
                .map(|index| (name.clone(), index))
        });
        let (queue_name, index) = location.ok_or_else(|| ClientError::ConsumerNotFound(tag.clone()))?;

        let delete_queue = match state.queues.get_mut(&queue_name) {
            Some(queue) => {
                let consumer = queue.consumers.remove(index);
                consumer.task.abort();
                queue.auto_delete && queue.consumers.is_empty()
            }
            None => false,
        };
        if delete_queue {
            tracing::debug!("Auto-deleting queue {}", queue_name);
            state.remove_queue(&queue_name);
        }

        Counters::bump(&self.shared.counters.consumers_cancelled);
        Ok(())
    }

    /// Drop every consumer on `channel` and every exclusive queue it owns.
    fn release_channel(&self, channel: ChannelId) {
        let mut state = self.shared.state.lock();
        let mut doomed = Vec::new();
        let mut cancelled = 0;

        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| {
                if c.channel == channel {
                    c.task.abort();
                    false
                } else {
                    true
                }
            });
            let removed = before - queue.consumers.len();
            cancelled += removed;

            let orphaned = queue.auto_delete && removed > 0 && queue.consumers.is_empty();
            if (queue.exclusive && queue.owner == channel) || orphaned {
                doomed.push(name.clone());
            }
        }

        for name in doomed {
            state.remove_queue(&name);
        }

        self.shared
            .counters
            .consumers_cancelled
            .fetch_add(cancelled, Ordering::Relaxed);
        Counters::bump(&self.shared.counters.channels_closed);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .finish()
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    broker: MemoryBroker,
    connected: Arc<AtomicBool>,
    errors: broadcast::Sender<ClientError>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    /// Create an unconnected connection to `broker`.
    pub fn new(broker: MemoryBroker) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            broker,
            connected: Arc::new(AtomicBool::new(false)),
            errors,
            channels: Mutex::new(Vec::new()),
        }
    }

    /// The broker this connection talks to.
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Simulate a connection-level failure.
    ///
    /// The connection drops to disconnected and the error is broadcast to every
    /// `errors()` subscriber.
    pub fn inject_error(&self, reason: impl Into<String>) {
        self.connected.store(false, Ordering::SeqCst);
        let error = ClientError::ConnectionLost(reason.into());
        tracing::debug!("Memory connection failing: {}", error);
        // No subscribers is fine: nobody is listening for errors yet.
        let _ = self.errors.send(error);
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn connect(&self) -> Result<()> {
        self.broker.gate(Operation::Connect).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn channel(&self) -> Arc<dyn Channel> {
        let channel = Arc::new(MemoryChannel {
            id: self.broker.next_channel_id(),
            broker: self.broker.clone(),
            connected: Arc::clone(&self.connected),
            open: AtomicBool::new(true),
        });
        let mut channels = self.channels.lock();
        channels.retain(|c| c.is_open());
        channels.push(Arc::clone(&channel));
        channel
    }

    fn errors(&self) -> broadcast::Receiver<ClientError> {
        self.errors.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            channel.release();
        }
        Ok(())
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: ChannelId,
    broker: MemoryBroker,
    connected: Arc<AtomicBool>,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_usable(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(ClientError::ChannelClosed(self.id));
        }
        Ok(())
    }

    /// Mark closed and release broker-side resources, once.
    fn release(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.release_channel(self.id);
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, exchange: &Exchange) -> Result<()> {
        self.ensure_usable()?;
        self.broker.gate(Operation::DeclareExchange).await?;
        self.ensure_usable()?;
        self.broker.declare_exchange(exchange)
    }

    async fn declare_queue(&self, queue: &Queue) -> Result<()> {
        self.ensure_usable()?;
        self.broker.gate(Operation::DeclareQueue).await?;
        self.ensure_usable()?;
        self.broker.declare_queue(self.id, queue)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<()> {
        self.ensure_usable()?;
        self.broker.gate(Operation::Publish).await?;
        self.ensure_usable()?;
        self.broker.publish(exchange, routing_key, message)
    }

    async fn consume(&self, queue: &str, _no_ack: bool, handler: MessageHandler) -> Result<ConsumerTag> {
        self.ensure_usable()?;
        self.broker.gate(Operation::Consume).await?;
        self.ensure_usable()?;
        self.broker.consume(self.id, queue, handler)
    }

    async fn cancel(&self, tag: &ConsumerTag) -> Result<()> {
        self.ensure_usable()?;
        self.broker.gate(Operation::Cancel).await?;
        self.broker.cancel(self.id, tag)
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        if let Err(e) = self.broker.gate(Operation::CloseChannel).await {
            // Resources are released even when the close itself reports failure.
            self.release();
            return Err(e);
        }
        self.release();
        Ok(())
    }
}
