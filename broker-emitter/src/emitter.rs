//! Event router over a topic exchange
//!
//! Local code registers listeners by event name and emits payloads. Behind the
//! listener sets, the emitter keeps exactly one broker subscription (queue,
//! consumer, channel) per event that has listeners, creating it when the first
//! listener arrives and tearing it down when the last one leaves.
//!
//! Listener mutations are synchronous. Each one is followed by a reconcile loop
//! that steps the event's registry entry towards the listener set, one
//! transition at a time, under the registry lock. Setup and teardown run as
//! spawned tasks; their [`Completion`]s are stored in the entry so later steps
//! wait for them instead of starting a second operation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use broker_client::{
    ClientError, Connection, Consumer, Exchange, Message, Producer, PublishOptions, Queue,
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::bridge::DeliveryBridge;
use crate::completion::{Completion, Listener};
use crate::config::EmitterConfig;
use crate::error::{EmitterError, Result};
use crate::listeners::{ErrorHandler, ErrorListeners, Handler, ListenerId, ListenerRegistry};
use crate::registry::{ActiveSubscription, SubscriptionRegistry, SubscriptionState, SubscriptionStatus};

/// Content type applied by [`Emitter::emit_json`] unless one is set
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Event emitter backed by a message broker
///
/// Cloning is cheap; clones share listeners, subscriptions and the connection.
///
/// Dropping the last clone does not release broker resources. Call
/// [`close`](Self::close) to cancel consumers and close every channel and the
/// connection; otherwise consumer tasks keep running until the broker goes away.
#[derive(Clone)]
pub struct Emitter {
    inner: Arc<Inner>,
}

struct Inner {
    config: EmitterConfig,
    name: String,
    connection: Arc<dyn Connection>,
    exchange: Exchange,
    producer: Producer,
    connected: AtomicBool,
    listeners: Arc<ListenerRegistry>,
    error_listeners: Arc<ErrorListeners>,
    registry: Mutex<SubscriptionRegistry>,
    runtime: OnceLock<Handle>,
    forwarding_errors: AtomicBool,
}

/// Outcome of one reconcile step
enum Step {
    Settled,
    AwaitSetup(Completion),
    AwaitTeardown(Completion),
    Failed(EmitterError),
}

impl Emitter {
    /// Create an emitter connected to the configured URI (`memory://default` if unset)
    ///
    /// Nothing is sent to the broker until [`connect`](Self::connect).
    pub fn new(config: EmitterConfig) -> Result<Self> {
        config.validate()?;
        let connection =
            broker_client::open(config.effective_uri()).map_err(EmitterError::Connection)?;
        Self::with_connection(config, connection)
    }

    /// Create an emitter over an existing connection; `config.uri` is ignored
    pub fn with_connection(config: EmitterConfig, connection: Arc<dyn Connection>) -> Result<Self> {
        config.validate()?;

        let name = format!("{}-{}", config.name_prefix, Uuid::new_v4());
        let exchange = Exchange::new(config.exchange_name.clone(), config.exchange_type);
        let producer = Producer::new(connection.channel(), exchange.clone(), config.routing_key.clone());

        tracing::debug!("Created emitter {} for exchange {}", name, exchange.name);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                name,
                connection,
                exchange,
                producer,
                connected: AtomicBool::new(false),
                listeners: Arc::new(ListenerRegistry::new()),
                error_listeners: Arc::new(ErrorListeners::default()),
                registry: Mutex::new(SubscriptionRegistry::new()),
                runtime: OnceLock::new(),
                forwarding_errors: AtomicBool::new(false),
            }),
        })
    }

    /// Connect to the broker and declare the shared exchange
    ///
    /// Connection errors raised afterwards are forwarded to error listeners.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if let Ok(handle) = Handle::try_current() {
            let _ = inner.runtime.set(handle);
        }

        let errors = inner.connection.errors();
        inner.connection.connect().await.map_err(EmitterError::Connection)?;
        inner
            .producer
            .declare()
            .await
            .map_err(|source| EmitterError::Declare {
                resource: format!("exchange {}", inner.exchange.name),
                source,
            })?;

        inner.connected.store(true, Ordering::SeqCst);
        match inner.runtime() {
            Some(handle) => {
                if !inner.forwarding_errors.swap(true, Ordering::SeqCst) {
                    handle.spawn(forward_connection_errors(Arc::downgrade(inner), errors));
                }
            }
            None => tracing::warn!("No runtime to forward connection errors of {}", inner.name),
        }

        tracing::info!(
            "Emitter {} connected, exchange {} ({}) declared",
            inner.name,
            inner.exchange.name,
            inner.exchange.kind
        );
        Ok(())
    }

    /// Publish `data` to the exchange
    ///
    /// The routing key is `options.routing_key`, else `event`, else the
    /// configured default. Nothing is delivered locally except through the
    /// broker.
    pub async fn emit(&self, event: &str, data: impl Into<Bytes>, options: PublishOptions) -> Result<()> {
        if !self.is_connected() {
            return Err(EmitterError::NotConnected);
        }

        let options = if options.routing_key.is_none() && !event.is_empty() {
            options.with_routing_key(event)
        } else {
            options
        };

        let route = self.inner.producer.route(options);
        let routing_key = route.routing_key().to_string();
        route
            .publish(data)
            .await
            .map_err(|source| EmitterError::Publish {
                routing_key: routing_key.clone(),
                source,
            })?;

        tracing::debug!("Emitted {} on {}", routing_key, self.inner.exchange.name);
        Ok(())
    }

    /// Serialize `value` as JSON and [`emit`](Self::emit) it
    pub async fn emit_json<T: Serialize + ?Sized>(
        &self,
        event: &str,
        value: &T,
        options: PublishOptions,
    ) -> Result<()> {
        let body = serde_json::to_vec(value).map_err(|e| EmitterError::Serialization(e.to_string()))?;
        let options = if options.content_type.is_none() {
            options.with_content_type(JSON_CONTENT_TYPE)
        } else {
            options
        };
        self.emit(event, body, options).await
    }

    /// Register `handler` for messages matching `event`
    ///
    /// The first listener for an event starts the broker subscription in the
    /// background; await the returned [`Listener`] to know it is ready.
    pub fn add_listener<F>(&self, event: &str, handler: F) -> Listener
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register(event, ListenerId::next(), Arc::new(handler))
    }

    /// Alias for [`add_listener`](Self::add_listener)
    pub fn on<F>(&self, event: &str, handler: F) -> Listener
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.add_listener(event, handler)
    }

    /// Register `handler` to run for at most one message
    ///
    /// The listener removes itself before the handler runs.
    pub fn once<F>(&self, event: &str, handler: F) -> Listener
    where
        F: FnOnce(&Message) + Send + 'static,
    {
        let id = ListenerId::next();
        let slot = Mutex::new(Some(handler));
        let weak = Arc::downgrade(&self.inner);
        let event_name = event.to_string();

        let wrapped: Handler = Arc::new(move |message: &Message| {
            let Some(handler) = slot.lock().take() else {
                return;
            };
            if let Some(inner) = weak.upgrade() {
                let _ = inner.remove(&event_name, id);
            }
            handler(message);
        });

        self.register(event, id, wrapped)
    }

    /// Remove one listener; the last one for an event tears its subscription down
    ///
    /// Unknown events and ids are ignored.
    pub fn remove_listener(&self, event: &str, id: ListenerId) -> Completion {
        self.inner.remove(event, id)
    }

    /// Remove every listener and tear down every subscription
    pub fn remove_all_listeners(&self) -> Completion {
        let inner = &self.inner;
        let mut events = inner.listeners.clear();
        events.extend(inner.registry.lock().events());
        events.sort();
        events.dedup();

        tracing::debug!("Removing all listeners of {} ({} event(s))", inner.name, events.len());
        Completion::all(events.iter().map(|event| inner.schedule(event)).collect())
    }

    /// Remove every listener for the given events and tear down their subscriptions
    pub fn remove_all_listeners_for<I, S>(&self, events: I) -> Completion
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let inner = &self.inner;
        let completions = events
            .into_iter()
            .map(|event| {
                let event = event.as_ref();
                let removed = inner.listeners.clear_event(event);
                tracing::debug!("Removed {} listener(s) for {}", removed, event);
                inner.schedule(event)
            })
            .collect();
        Completion::all(completions)
    }

    /// Register a handler for errors that have no caller to return to
    pub fn on_error<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&EmitterError) + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(handler);
        self.inner.error_listeners.add(handler)
    }

    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        self.inner.error_listeners.remove(id)
    }

    /// Tear down every subscription, then close the producer channel and the connection
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let teardown = self.remove_all_listeners().await;
        let channel = inner.producer.channel().close().await;
        let connection = inner.connection.close().await;
        inner.connected.store(false, Ordering::SeqCst);

        tracing::info!("Emitter {} closed", inner.name);

        teardown?;
        channel.map_err(EmitterError::Connection)?;
        connection.map_err(EmitterError::Connection)
    }

    /// Generated unique name; prefixes every queue this emitter declares
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn exchange(&self) -> &Exchange {
        &self.inner.exchange
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst) && self.inner.connection.is_connected()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.listeners.count(event)
    }

    /// Events with at least one local listener, sorted
    pub fn event_names(&self) -> Vec<String> {
        self.inner.listeners.event_names()
    }

    pub fn subscription_status(&self, event: &str) -> Option<SubscriptionStatus> {
        self.inner.registry.lock().status(event)
    }

    /// Events whose broker consumer is running, sorted
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.inner.registry.lock().active_events()
    }

    /// Name of the queue backing an active subscription
    pub fn subscription_queue(&self, event: &str) -> Option<String> {
        self.inner.registry.lock().queue_name(event)
    }

    fn register(&self, event: &str, id: ListenerId, handler: Handler) -> Listener {
        self.inner.listeners.insert(event, id, handler);
        tracing::debug!(
            "Added {} for {} ({} listener(s))",
            id,
            event,
            self.inner.listeners.count(event)
        );
        Listener::new(id, event, self.inner.schedule(event))
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("name", &self.inner.name)
            .field("exchange", &self.inner.exchange.name)
            .field("connected", &self.is_connected())
            .field("events", &self.event_names())
            .finish()
    }
}

impl Inner {
    fn remove(self: &Arc<Self>, event: &str, id: ListenerId) -> Completion {
        if !self.listeners.remove(event, id) {
            tracing::debug!("Ignoring removal of unknown {} for {}", id, event);
            return Completion::ready();
        }

        tracing::debug!(
            "Removed {} for {} ({} listener(s) left)",
            id,
            event,
            self.listeners.count(event)
        );
        self.schedule(event)
    }

    /// Take the first reconcile step now and finish the rest in the background
    fn schedule(self: &Arc<Self>, event: &str) -> Completion {
        match self.step(event) {
            Step::Settled => Completion::ready(),
            Step::Failed(e) => Completion::failed(e),
            Step::AwaitSetup(_) | Step::AwaitTeardown(_) => {
                let inner = Arc::clone(self);
                let event = event.to_string();
                self.spawn(async move { inner.reconcile(event).await })
                    .unwrap_or_else(|| Completion::failed(EmitterError::NoRuntime))
            }
        }
    }

    /// Step until the registry entry matches the listener set
    async fn reconcile(self: Arc<Self>, event: String) -> Result<()> {
        let mut teardown_error = None;

        loop {
            match self.step(&event) {
                Step::Settled => break,
                Step::Failed(e) => return Err(e),
                Step::AwaitSetup(op) => {
                    if let Err(e) = op.await {
                        if self.listeners.count(&event) > 0 {
                            return Err(e);
                        }
                    }
                }
                Step::AwaitTeardown(op) => {
                    if let Err(e) = op.await {
                        teardown_error.get_or_insert(e);
                    }
                }
            }
        }

        // A teardown failure only matters to callers that wanted the subscription gone.
        match teardown_error {
            Some(e) if self.listeners.count(&event) == 0 => Err(e),
            _ => Ok(()),
        }
    }

    /// One transition of the event's registry entry, under the registry lock
    fn step(self: &Arc<Self>, event: &str) -> Step {
        let mut registry = self.registry.lock();
        let wanted = self.listeners.count(event) > 0;

        let tear_down = match registry.get(event) {
            None if !wanted => return Step::Settled,
            None => false,
            Some(SubscriptionState::Pending { op, .. }) => return Step::AwaitSetup(op.clone()),
            Some(SubscriptionState::TearingDown { op, .. }) => {
                return Step::AwaitTeardown(op.clone())
            }
            Some(SubscriptionState::Active { .. }) if wanted => return Step::Settled,
            Some(SubscriptionState::Active { .. }) => true,
        };

        let Some(handle) = self.runtime() else {
            return Step::Failed(EmitterError::NoRuntime);
        };

        if !tear_down {
            let generation = registry.next_generation();
            tracing::debug!("Setting up subscription for {} (generation {})", event, generation);
            let op = Completion::from_task(
                handle.spawn(Arc::clone(self).setup(event.to_string(), generation)),
            );
            registry.insert(
                event,
                SubscriptionState::Pending {
                    generation,
                    op: op.clone(),
                },
            );
            return Step::AwaitSetup(op);
        }

        let Some((generation, subscription)) = registry.take_active(event) else {
            return Step::Settled;
        };
        tracing::debug!("Tearing down subscription for {} (generation {})", event, generation);
        let op = Completion::from_task(handle.spawn(Arc::clone(self).teardown(
            event.to_string(),
            generation,
            subscription,
        )));
        registry.insert(
            event,
            SubscriptionState::TearingDown {
                generation,
                op: op.clone(),
            },
        );
        Step::AwaitTeardown(op)
    }

    async fn setup(self: Arc<Self>, event: String, generation: u64) -> Result<()> {
        match self.subscribe(&event).await {
            Ok(subscription) => {
                let queue_name = subscription.queue_name.clone();
                let stale = self.registry.lock().activate(&event, generation, subscription);
                match stale {
                    Ok(()) => {
                        tracing::debug!("Subscription for {} active on queue {}", event, queue_name);
                    }
                    Err(subscription) => {
                        tracing::debug!("Discarding stale subscription for {} (generation {})", event, generation);
                        if let Err(e) = subscription.shutdown().await {
                            tracing::warn!("Failed to release stale subscription for {}: {}", event, e);
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.registry.lock().remove_if_generation(&event, generation);
                tracing::warn!("{}", e);
                Err(e)
            }
        }
    }

    /// Open a channel, declare the event's queue and start consuming
    async fn subscribe(&self, event: &str) -> Result<ActiveSubscription> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(EmitterError::NotConnected);
        }

        let channel = self.connection.channel();
        let queue_name = format!("{}.event.{}.{}", self.name, event, Uuid::new_v4());
        let queue = Queue::new(queue_name.clone(), event, self.exchange.clone())
            .with_exclusive(true)
            .with_auto_delete(true)
            .with_durable(false);

        let bridge = DeliveryBridge::new(
            event,
            Arc::clone(&self.listeners),
            Arc::clone(&self.error_listeners),
        );
        let consumer = Consumer::new(Arc::clone(&channel), vec![queue], true, bridge.into_handler());

        let started: std::result::Result<(), ClientError> = async {
            consumer.declare().await?;
            consumer.consume().await
        }
        .await;

        if let Err(source) = started {
            if let Err(e) = channel.close().await {
                tracing::debug!("Failed to close channel {} after setup failure: {}", channel.id(), e);
            }
            return Err(EmitterError::Subscribe {
                event: event.to_string(),
                source,
            });
        }

        Ok(ActiveSubscription {
            consumer,
            queue_name,
        })
    }

    async fn teardown(
        self: Arc<Self>,
        event: String,
        generation: u64,
        subscription: ActiveSubscription,
    ) -> Result<()> {
        let result = subscription.shutdown().await;
        self.registry.lock().remove_if_generation(&event, generation);

        match result {
            Ok(()) => {
                tracing::debug!("Subscription for {} torn down ({})", event, subscription.queue_name);
                Ok(())
            }
            Err(source) => {
                let error = EmitterError::Teardown { event, source };
                tracing::warn!("{}", error);
                Err(error)
            }
        }
    }

    fn runtime(&self) -> Option<Handle> {
        Handle::try_current()
            .ok()
            .or_else(|| self.runtime.get().cloned())
    }

    fn spawn<F>(&self, fut: F) -> Option<Completion>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.runtime().map(|handle| Completion::from_task(handle.spawn(fut)))
    }
}

async fn forward_connection_errors(
    inner: Weak<Inner>,
    mut errors: tokio::sync::broadcast::Receiver<ClientError>,
) {
    loop {
        match errors.recv().await {
            Ok(error) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let error = EmitterError::Connection(error);
                tracing::warn!("Connection error on emitter {}: {}", inner.name, error);
                inner.error_listeners.report(&error);
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Dropped {} connection error(s) while forwarding", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
