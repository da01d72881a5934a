//! Per-event broker subscription state
//!
//! One entry per event name. An entry is created `Pending` when setup starts,
//! becomes `Active` once the consumer runs, and is `TearingDown` while the
//! consumer and its channel are released. Absent means no broker resources.
//! Each entry carries the generation of the operation that created it, so a
//! finishing operation only touches the entry it owns.

use std::collections::HashMap;
use std::sync::Arc;

use broker_client::{Channel, Consumer};

use crate::completion::Completion;

/// Observable lifecycle state of an event subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    /// Setup is in flight
    Pending,
    /// The consumer is running
    Active,
    /// Teardown is in flight
    TearingDown,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionStatus::Pending => write!(f, "pending"),
            SubscriptionStatus::Active => write!(f, "active"),
            SubscriptionStatus::TearingDown => write!(f, "tearing-down"),
        }
    }
}

/// Broker resources owned by an active subscription
#[derive(Debug)]
pub(crate) struct ActiveSubscription {
    pub consumer: Consumer,
    pub queue_name: String,
}

impl ActiveSubscription {
    pub fn channel(&self) -> &Arc<dyn Channel> {
        self.consumer.channel()
    }

    /// Cancel the consumer, then close its channel
    ///
    /// Both steps always run; the first failure is returned.
    pub async fn shutdown(&self) -> broker_client::Result<()> {
        let cancelled = self.consumer.cancel().await;
        let closed = self.channel().close().await;
        cancelled.and(closed)
    }
}

pub(crate) enum SubscriptionState {
    Pending {
        generation: u64,
        op: Completion,
    },
    Active {
        generation: u64,
        subscription: ActiveSubscription,
    },
    TearingDown {
        generation: u64,
        op: Completion,
    },
}

impl SubscriptionState {
    pub fn generation(&self) -> u64 {
        match self {
            SubscriptionState::Pending { generation, .. }
            | SubscriptionState::Active { generation, .. }
            | SubscriptionState::TearingDown { generation, .. } => *generation,
        }
    }

    pub fn status(&self) -> SubscriptionStatus {
        match self {
            SubscriptionState::Pending { .. } => SubscriptionStatus::Pending,
            SubscriptionState::Active { .. } => SubscriptionStatus::Active,
            SubscriptionState::TearingDown { .. } => SubscriptionStatus::TearingDown,
        }
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<String, SubscriptionState>,
    next_generation: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn get(&self, event: &str) -> Option<&SubscriptionState> {
        self.entries.get(event)
    }

    pub fn status(&self, event: &str) -> Option<SubscriptionStatus> {
        self.entries.get(event).map(SubscriptionState::status)
    }

    pub fn insert(&mut self, event: &str, state: SubscriptionState) {
        self.entries.insert(event.to_string(), state);
    }

    /// Swap a `Pending` entry for `Active`
    ///
    /// Hands the subscription back if the entry is gone or belongs to another
    /// generation.
    pub fn activate(
        &mut self,
        event: &str,
        generation: u64,
        subscription: ActiveSubscription,
    ) -> Result<(), ActiveSubscription> {
        let owned = matches!(
            self.entries.get(event),
            Some(SubscriptionState::Pending { generation: current, .. }) if *current == generation
        );
        if !owned {
            return Err(subscription);
        }

        self.entries.insert(
            event.to_string(),
            SubscriptionState::Active {
                generation,
                subscription,
            },
        );
        Ok(())
    }

    /// Take the subscription out of an `Active` entry, leaving nothing behind
    pub fn take_active(&mut self, event: &str) -> Option<(u64, ActiveSubscription)> {
        match self.entries.remove(event)? {
            SubscriptionState::Active {
                generation,
                subscription,
            } => Some((generation, subscription)),
            other => {
                self.entries.insert(event.to_string(), other);
                None
            }
        }
    }

    /// Remove the entry only if it still belongs to `generation`
    pub fn remove_if_generation(&mut self, event: &str, generation: u64) -> bool {
        let owned = self
            .entries
            .get(event)
            .is_some_and(|entry| entry.generation() == generation);
        if owned {
            self.entries.remove(event);
        }
        owned
    }

    /// Every event with an entry, sorted
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.entries.keys().cloned().collect();
        events.sort();
        events
    }

    /// Events whose consumer is running, sorted
    pub fn active_events(&self) -> Vec<String> {
        let mut events: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, state)| matches!(state, SubscriptionState::Active { .. }))
            .map(|(event, _)| event.clone())
            .collect();
        events.sort();
        events
    }

    pub fn queue_name(&self, event: &str) -> Option<String> {
        match self.entries.get(event) {
            Some(SubscriptionState::Active { subscription, .. }) => {
                Some(subscription.queue_name.clone())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_client::{Connection, Exchange, MemoryBroker, MemoryConnection, Queue};

    async fn subscription(connection: &MemoryConnection, queue: &str) -> ActiveSubscription {
        let queue = Queue::new(queue, "x", Exchange::topic("events"));
        let consumer = Consumer::new(connection.channel(), vec![queue], true, Arc::new(|_: broker_client::Message| {}));
        consumer.declare().await.unwrap();
        consumer.consume().await.unwrap();
        ActiveSubscription {
            consumer,
            queue_name: "q".to_string(),
        }
    }

    async fn connection() -> MemoryConnection {
        let connection = MemoryConnection::new(MemoryBroker::new());
        connection.connect().await.unwrap();
        connection
    }

    #[tokio::test]
    async fn test_activate_checks_generation() {
        let connection = connection().await;
        let mut registry = SubscriptionRegistry::new();

        let generation = registry.next_generation();
        registry.insert(
            "x",
            SubscriptionState::Pending {
                generation,
                op: Completion::ready(),
            },
        );
        assert_eq!(registry.status("x"), Some(SubscriptionStatus::Pending));

        let stale = registry.activate("x", generation + 1, subscription(&connection, "q1").await);
        assert!(stale.is_err());
        assert_eq!(registry.status("x"), Some(SubscriptionStatus::Pending));

        assert!(registry
            .activate("x", generation, subscription(&connection, "q2").await)
            .is_ok());
        assert_eq!(registry.status("x"), Some(SubscriptionStatus::Active));
        assert_eq!(registry.active_events(), vec!["x".to_string()]);
        assert_eq!(registry.queue_name("x").as_deref(), Some("q"));
    }

    #[tokio::test]
    async fn test_take_active_only_takes_active() {
        let connection = connection().await;
        let mut registry = SubscriptionRegistry::new();

        let generation = registry.next_generation();
        registry.insert(
            "pending",
            SubscriptionState::Pending {
                generation,
                op: Completion::ready(),
            },
        );
        assert!(registry.take_active("pending").is_none());
        assert_eq!(registry.status("pending"), Some(SubscriptionStatus::Pending));

        let generation = registry.next_generation();
        registry.insert(
            "active",
            SubscriptionState::Active {
                generation,
                subscription: subscription(&connection, "q").await,
            },
        );
        let (taken_generation, taken) = registry.take_active("active").unwrap();
        assert_eq!(taken_generation, generation);
        assert!(registry.get("active").is_none());
        assert!(taken.shutdown().await.is_ok());
        assert!(!taken.channel().is_open());
    }

    #[test]
    fn test_remove_if_generation() {
        let mut registry = SubscriptionRegistry::new();
        let generation = registry.next_generation();
        registry.insert(
            "x",
            SubscriptionState::TearingDown {
                generation,
                op: Completion::ready(),
            },
        );

        assert!(!registry.remove_if_generation("x", generation + 1));
        assert_eq!(registry.events(), vec!["x".to_string()]);
        assert!(registry.remove_if_generation("x", generation));
        assert!(registry.events().is_empty());
        assert!(!registry.remove_if_generation("x", generation));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SubscriptionStatus::Pending.to_string(), "pending");
        assert_eq!(SubscriptionStatus::TearingDown.to_string(), "tearing-down");
    }
}
