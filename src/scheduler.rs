//! A strictly serial FIFO job queue.
//!
//! Jobs are drained by a single tokio task, spawned lazily on the first push,
//! so two jobs never run at the same time and they finish in push order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::BuildError;
use crate::utils::lock;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct SerialQueue {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Jobs pushed but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Append a job. Must be called from within a tokio runtime.
    pub fn push<F, T>(&self, job: F) -> Result<JobHandle<T>, BuildError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.start()?;

        let (tx, rx) = oneshot::channel();
        let pending = self.pending.clone();
        pending.fetch_add(1, Ordering::SeqCst);

        let job: Job = Box::pin(async move {
            let output = job.await;
            pending.fetch_sub(1, Ordering::SeqCst);
            // nobody waiting is fine
            let _ = tx.send(output);
        });

        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(BuildError::QueueClosed);
        }

        Ok(JobHandle { rx })
    }

    fn start(&self) -> Result<(), BuildError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|_| BuildError::QueueClosed)?;
        let Some(mut rx) = lock(&self.rx).take() else {
            return Err(BuildError::QueueClosed);
        };

        *worker = Some(handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        }));

        Ok(())
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
    }
}

/// Resolves to the output of a queued job.
pub struct JobHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    pub async fn wait(self) -> Result<T, BuildError> {
        self.rx.await.map_err(|_| BuildError::QueueClosed)
    }
}
