//! Worker task group with cooperative cancellation.
//!
//! Every worker of the stack (accept, receive, send, retransmit timer,
//! dispatch loops, detector sweep) is spawned through a `TaskGroup` and
//! selects on its cancellation token. Shutting the group down cancels the
//! token and waits for every worker to return.

use futures::future::join_all;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

/// Shared handle to a group of worker tasks. Cheap to clone.
#[derive(Clone, Default)]
pub struct TaskGroup {
    cancel: CancellationToken,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that fires when the group shuts down.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawn a worker inside a span named after it.
    ///
    /// Workers are expected to return once the token is cancelled.
    pub fn spawn<F>(&self, span: tracing::Span, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(worker.instrument(span));
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Number of workers spawned so far (finished ones included).
    pub fn len(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every worker and wait for all of them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let count = handles.len();

        for result in join_all(handles).await {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!("Worker panicked before shutdown: {}", e);
                }
            }
        }
        debug!("Stopped {} worker(s)", count);
    }
}
