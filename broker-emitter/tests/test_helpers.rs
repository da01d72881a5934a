//! Shared helpers for broker-emitter integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use broker_client::{Connection, MemoryBroker, MemoryConnection};
use broker_emitter::{Emitter, EmitterConfig, EmitterError, Message};
use tokio::sync::mpsc;

/// How long to wait for something that should happen
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to wait before concluding something did not happen
pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// An emitter wired to a private in-process broker
pub struct TestEmitter {
    pub broker: MemoryBroker,
    pub connection: Arc<MemoryConnection>,
    pub emitter: Emitter,
}

/// Build an emitter on a fresh broker without connecting it
pub fn unconnected_emitter(exchange: &str) -> TestEmitter {
    let broker = MemoryBroker::new();
    emitter_on(&broker, exchange)
}

/// Build an emitter on `broker` without connecting it
pub fn emitter_on(broker: &MemoryBroker, exchange: &str) -> TestEmitter {
    let connection = Arc::new(MemoryConnection::new(broker.clone()));
    let shared: Arc<dyn Connection> = connection.clone();
    let emitter = Emitter::with_connection(EmitterConfig::new(exchange), shared)
        .expect("Failed to create emitter");

    TestEmitter {
        broker: broker.clone(),
        connection,
        emitter,
    }
}

/// Build and connect an emitter on a fresh broker
pub async fn connected_emitter(exchange: &str) -> TestEmitter {
    let test = unconnected_emitter(exchange);
    test.emitter.connect().await.expect("Failed to connect emitter");
    test
}

/// A listener that forwards every message into a channel
pub fn collector() -> (impl Fn(&Message) + Send + Sync + 'static, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: &Message| {
        let _ = tx.send(message.clone());
    };
    (handler, rx)
}

/// An error listener that forwards every error into a channel
pub fn error_collector() -> (
    impl Fn(&EmitterError) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<EmitterError>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |error: &EmitterError| {
        let _ = tx.send(error.clone());
    };
    (handler, rx)
}

/// Receive the next item or fail the test
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Channel closed")
}

/// Assert nothing arrives during the quiet period
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(item)) = tokio::time::timeout(QUIET_PERIOD, rx.recv()).await {
        panic!("Unexpected delivery: {:?}", item);
    }
}

/// Poll `condition` until it holds or fail the test
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Timed out waiting for condition"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
