//! Deferred operation queue.
//!
//! Work that must not run on the caller's path (latent attachment, cache
//! cleanup after reclamation, merges on latent hits) is enqueued here and
//! executed in FIFO order by a single worker task. Each operation may carry a
//! disposable resource (typically a per-id lock guard) that is released once
//! the operation has run.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::telemetry;
use crate::{MuninnError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationKind {
    Cleanup,
    AttachLatent,
    Update,
    Barrier,
}

impl OperationKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Cleanup => "cleanup",
            OperationKind::AttachLatent => "attach_latent",
            OperationKind::Update => "update",
            OperationKind::Barrier => "barrier",
        }
    }
}

/// One unit of deferred work.
pub(crate) struct Operation {
    kind: OperationKind,
    name: String,
    task: BoxFuture<'static, Result<()>>,
    dispose: Option<Box<dyn Any + Send>>,
    notify: Option<oneshot::Sender<()>>,
}

impl Operation {
    fn new(
        kind: OperationKind,
        name: String,
        task: BoxFuture<'static, Result<()>>,
    ) -> Self {
        Self {
            kind,
            name,
            task,
            dispose: None,
            notify: None,
        }
    }

    pub(crate) fn cleanup(name: String, task: BoxFuture<'static, Result<()>>) -> Self {
        Self::new(OperationKind::Cleanup, name, task)
    }

    pub(crate) fn update(name: String, task: BoxFuture<'static, Result<()>>) -> Self {
        Self::new(OperationKind::Update, name, task)
    }

    /// Attach a latent entity; `guard` is held until the task has run.
    pub(crate) fn attach_latent<G: Send + 'static>(
        name: String,
        task: BoxFuture<'static, Result<()>>,
        guard: G,
    ) -> Self {
        let mut op = Self::new(OperationKind::AttachLatent, name, task);
        op.dispose = Some(Box::new(guard));
        op
    }

    /// No-op that signals `done` once every earlier operation has run.
    pub(crate) fn barrier(done: oneshot::Sender<()>) -> Self {
        let mut op = Self::new(
            OperationKind::Barrier,
            "barrier".to_owned(),
            Box::pin(async { Ok(()) }),
        );
        op.notify = Some(done);
        op
    }
}

/// Sending side of the queue, shared by the controller and its brokers.
#[derive(Clone)]
pub(crate) struct OperationQueue {
    tx: mpsc::UnboundedSender<Operation>,
    pending: Arc<AtomicUsize>,
}

impl OperationQueue {
    /// Create a queue and spawn its worker on the current tokio runtime.
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_worker(rx, Arc::clone(&pending)));
        Self { tx, pending }
    }

    pub(crate) fn enqueue(&self, op: Operation) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(op).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            MuninnError::Shutdown
        })
    }

    /// Operations enqueued but not yet finished.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Operation>, pending: Arc<AtomicUsize>) {
    while let Some(op) = rx.recv().await {
        let Operation {
            kind,
            name,
            task,
            dispose,
            notify,
        } = op;
        let operation = kind.as_str();

        trace!(operation, %name, "running deferred operation");
        metrics::counter!(telemetry::OPERATIONS_TOTAL, "operation" => operation).increment(1);

        if let Err(e) = task.await {
            metrics::counter!(telemetry::OPERATION_FAILURES_TOTAL, "operation" => operation)
                .increment(1);
            warn!(operation, %name, error = %e, "deferred operation failed");
        }

        drop(dispose);
        pending.fetch_sub(1, Ordering::AcqRel);

        if let Some(notify) = notify {
            let _ = notify.send(());
        }
    }
    debug!("operation queue closed");
}
