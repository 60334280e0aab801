//! Execution queue: runs tasks one at a time in the order they were enqueued.

use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Serializes asynchronous tasks against one backend.
///
/// Ordering is fixed when [`enqueue`](Self::enqueue) is called, not when its
/// future is first polled. A task that fails or panics does not stop the
/// tasks after it.
#[derive(Default)]
pub struct ExecutionQueue {
    sender: OnceLock<mpsc::UnboundedSender<Task>>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self) -> &mpsc::UnboundedSender<Task> {
        self.sender.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(drain(rx));
            tx
        })
    }

    /// Queue a task and get a future for its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<F, T>(&self, task: F) -> impl Future<Output = Result<T>> + Send + use<F, T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: Task = Box::pin(task.map(move |output| {
            let _ = tx.send(output);
        }));
        let queued = self.sender().send(wrapped).is_ok();

        async move {
            if !queued {
                return Err(Error::TaskDropped);
            }
            rx.await.map_err(|_| Error::TaskDropped)
        }
    }
}

async fn drain(mut tasks: mpsc::UnboundedReceiver<Task>) {
    while let Some(task) = tasks.recv().await {
        if let Err(e) = tokio::spawn(task).await {
            if e.is_panic() {
                tracing::error!("Queued task panicked: {}", e);
            }
        }
    }
    tracing::debug!("Execution queue closed");
}
