//! Shared completion handles for background subscription work

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;

use crate::error::{EmitterError, Result};
use crate::listeners::ListenerId;

/// Settles when a background setup or teardown finishes
///
/// Cloning is cheap and every clone observes the same outcome. The underlying
/// work keeps running when all handles are dropped.
#[derive(Clone)]
pub struct Completion {
    inner: Shared<BoxFuture<'static, Result<()>>>,
}

impl Completion {
    /// A completion that has already succeeded
    pub fn ready() -> Self {
        Self::from_future(future::ready(Ok(())))
    }

    /// A completion that has already failed
    pub fn failed(error: EmitterError) -> Self {
        Self::from_future(future::ready(Err(error)))
    }

    pub(crate) fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            inner: fut.boxed().shared(),
        }
    }

    /// Wrap a spawned task; a cancelled or panicked task becomes `TaskFailed`
    pub(crate) fn from_task(handle: JoinHandle<Result<()>>) -> Self {
        Self::from_future(async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(EmitterError::TaskFailed(e.to_string())),
            }
        })
    }

    /// Settles once every completion has, with the first failure if any
    pub(crate) fn all(completions: Vec<Completion>) -> Self {
        if completions.is_empty() {
            return Self::ready();
        }

        Self::from_future(async move {
            future::join_all(completions)
                .await
                .into_iter()
                .collect::<Result<Vec<()>>>()
                .map(|_| ())
        })
    }

    /// The outcome, if some clone has already observed it
    pub fn peek(&self) -> Option<&Result<()>> {
        self.inner.peek()
    }

    pub fn is_settled(&self) -> bool {
        self.peek().is_some()
    }
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("outcome", &self.peek())
            .finish()
    }
}

/// Handle returned when a listener is added
///
/// Awaiting it yields the listener id once the event's broker subscription is
/// ready, or the setup error. Dropping it does not remove the listener.
#[derive(Debug, Clone)]
pub struct Listener {
    id: ListenerId,
    event: String,
    ready: Completion,
}

impl Listener {
    pub(crate) fn new(id: ListenerId, event: impl Into<String>, ready: Completion) -> Self {
        Self {
            id,
            event: event.into(),
            ready,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Completion of the subscription setup this listener depends on
    pub fn ready(&self) -> Completion {
        self.ready.clone()
    }
}

impl IntoFuture for Listener {
    type Output = Result<ListenerId>;
    type IntoFuture = BoxFuture<'static, Result<ListenerId>>;

    fn into_future(self) -> Self::IntoFuture {
        let id = self.id;
        async move { self.ready.await.map(|()| id) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_and_failed() {
        assert!(Completion::ready().await.is_ok());
        assert_eq!(
            Completion::failed(EmitterError::NotConnected).await,
            Err(EmitterError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_clones_share_outcome() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let completion = Completion::from_task(tokio::spawn(async move {
            let _ = rx.await;
            Err(EmitterError::NoRuntime)
        }));
        let other = completion.clone();
        assert!(!completion.is_settled());

        tx.send(()).unwrap();
        assert_eq!(completion.await, Err(EmitterError::NoRuntime));
        assert_eq!(other.peek(), Some(&Err(EmitterError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_panicked_task_becomes_task_failed() {
        let completion = Completion::from_task(tokio::spawn(async {
            if true {
                panic!("setup exploded");
            }
            Ok(())
        }));
        assert!(matches!(completion.await, Err(EmitterError::TaskFailed(_))));
    }

    #[tokio::test]
    async fn test_all_reports_first_failure() {
        assert!(Completion::all(Vec::new()).await.is_ok());

        let combined = Completion::all(vec![
            Completion::ready(),
            Completion::failed(EmitterError::NotConnected),
            Completion::failed(EmitterError::NoRuntime),
        ]);
        assert_eq!(combined.await, Err(EmitterError::NotConnected));
    }

    #[tokio::test]
    async fn test_listener_resolves_to_id() {
        let id = ListenerId::next();
        let listener = Listener::new(id, "x", Completion::ready());
        assert_eq!(listener.event(), "x");
        assert_eq!(listener.await, Ok(id));

        let failing = Listener::new(id, "x", Completion::failed(EmitterError::NotConnected));
        assert_eq!(failing.await, Err(EmitterError::NotConnected));
    }
}
