//! Exclusive task queue
//!
//! Serializes mutating operations: a single worker task runs submitted
//! futures one at a time in submission order. Each submitter waits on its
//! own completion channel and only sees its own task's outcome. A failing or
//! panicking task does not stop the worker.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{Result, RouterError};

type Job = BoxFuture<'static, ()>;

/// FIFO queue that runs one task at a time
///
/// Cloning yields another handle to the same worker. The worker exits once
/// every handle is dropped and the backlog is drained.
#[derive(Clone)]
pub struct ExclusiveQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl ExclusiveQueue {
    /// Create a queue and spawn its worker on the current tokio runtime
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime. Use [`ExclusiveQueue::try_new`]
    /// to get an error instead.
    pub fn new() -> Self {
        Self::spawn_on(&Handle::current())
    }

    /// Like [`ExclusiveQueue::new`], but fails when no tokio runtime is running
    pub fn try_new() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| RouterError::Internal(format!("exclusive queue needs a runtime: {}", e)))?;
        Ok(Self::spawn_on(&handle))
    }

    fn spawn_on(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!("Exclusive queue worker stopped");
        });

        Self { tx }
    }

    /// Submit `task` and wait for its result.
    ///
    /// The task is enqueued when this method is called, not when the
    /// returned future is first polled, and it runs to completion even if
    /// the returned future is dropped.
    pub fn run_exclusive<F, T>(&self, task: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();

        let job = async move {
            let outcome = AssertUnwindSafe(task).catch_unwind().await;
            if let Err(panic) = &outcome {
                error!("Exclusive task panicked: {}", panic_message(panic.as_ref()));
            }
            let _ = done_tx.send(outcome);
        }
        .boxed();

        let submitted = self.tx.send(job).map_err(|_| RouterError::QueueClosed);

        async move {
            submitted?;
            match done_rx.await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(RouterError::TaskPanicked(panic_message(panic.as_ref()))),
                Err(_) => Err(RouterError::QueueClosed),
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
