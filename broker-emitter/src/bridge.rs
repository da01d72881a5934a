//! Delivery bridge from an event's broker consumer to its local listeners

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use broker_client::{Message, MessageHandler};

use crate::error::EmitterError;
use crate::listeners::{ErrorListeners, ListenerRegistry};

/// Fans each inbound message out to the listeners registered for one event
///
/// Listeners are snapshotted per message, so handlers added or removed during
/// a delivery take effect from the next message.
pub(crate) struct DeliveryBridge {
    event: String,
    listeners: Arc<ListenerRegistry>,
    errors: Arc<ErrorListeners>,
}

impl DeliveryBridge {
    pub fn new(
        event: impl Into<String>,
        listeners: Arc<ListenerRegistry>,
        errors: Arc<ErrorListeners>,
    ) -> Self {
        Self {
            event: event.into(),
            listeners,
            errors,
        }
    }

    /// Invoke every listener with `message`, returning how many ran
    ///
    /// A panicking listener is reported as `ListenerPanicked` and the rest
    /// still run.
    pub fn deliver(&self, message: &Message) -> usize {
        let handlers = self.listeners.handlers(&self.event);
        tracing::debug!(
            "Delivering message {} on {} to {} listener(s) of {}",
            message.delivery_tag,
            message.routing_key,
            handlers.len(),
            self.event
        );

        for handler in &handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(message))) {
                let error = EmitterError::ListenerPanicked {
                    event: self.event.clone(),
                    message: panic_message(payload.as_ref()),
                };
                tracing::warn!("{}", error);
                self.errors.report(&error);
            }
        }

        handlers.len()
    }

    pub fn into_handler(self) -> MessageHandler {
        Arc::new(move |message: Message| {
            self.deliver(&message);
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_client::ConsumerTag;
    use bytes::Bytes;
    use parking_lot::Mutex;

    fn message(body: &'static str) -> Message {
        Message {
            body: Bytes::from_static(body.as_bytes()),
            headers: Default::default(),
            content_type: None,
            persistent: false,
            exchange: "events".to_string(),
            routing_key: "orders.created".to_string(),
            delivery_tag: 7,
            consumer_tag: ConsumerTag::new("amq.ctag-test"),
        }
    }

    fn bridge(event: &str) -> (DeliveryBridge, Arc<ListenerRegistry>, Arc<ErrorListeners>) {
        let listeners = Arc::new(ListenerRegistry::new());
        let errors = Arc::new(ErrorListeners::default());
        let bridge = DeliveryBridge::new(event, Arc::clone(&listeners), Arc::clone(&errors));
        (bridge, listeners, errors)
    }

    #[test]
    fn test_delivers_to_event_listeners_only() {
        let (bridge, listeners, _) = bridge("orders.#");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        listeners.add(
            "orders.#",
            Arc::new(move |m: &Message| sink.lock().push(m.body_str().unwrap_or_default().to_string())),
        );
        listeners.add("other", Arc::new(|_: &Message| panic!("wrong event")));

        assert_eq!(bridge.deliver(&message("hello")), 1);
        assert_eq!(*seen.lock(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_panicking_listener_is_isolated_and_reported() {
        let (bridge, listeners, errors) = bridge("x");
        let reached = Arc::new(Mutex::new(0));
        let reported = Arc::new(Mutex::new(Vec::new()));

        listeners.add("x", Arc::new(|_: &Message| panic!("listener exploded")));
        let counter = Arc::clone(&reached);
        listeners.add("x", Arc::new(move |_: &Message| *counter.lock() += 1));

        let sink = Arc::clone(&reported);
        errors.add(Arc::new(move |e: &EmitterError| sink.lock().push(e.clone())));

        let handler = bridge.into_handler();
        handler(message("a"));

        assert_eq!(*reached.lock(), 1);
        assert_eq!(
            *reported.lock(),
            vec![EmitterError::ListenerPanicked {
                event: "x".to_string(),
                message: "listener exploded".to_string(),
            }]
        );
    }

    #[test]
    fn test_no_listeners_is_noop() {
        let (bridge, _, _) = bridge("x");
        assert_eq!(bridge.deliver(&message("ignored")), 0);
    }
}
