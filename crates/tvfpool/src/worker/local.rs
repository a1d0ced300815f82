//! In-process worker pool: a fixed set of tokio tasks sharing one task queue.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::{DispatchTask, WorkerPool, WorkerPoolError, dispatch_contained};
use crate::functions::FunctionRegistry;

type TaskQueue = Arc<Mutex<mpsc::UnboundedReceiver<DispatchTask>>>;

pub struct LocalWorkerPool {
    queue: StdMutex<Option<mpsc::UnboundedSender<DispatchTask>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl LocalWorkerPool {
    /// Start `worker_count` workers. Must be called inside a tokio runtime.
    pub fn new(functions: Arc<FunctionRegistry>, worker_count: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx: TaskQueue = Arc::new(Mutex::new(rx));

        let workers = (0..worker_count)
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&functions), Arc::clone(&rx))))
            .collect();

        tracing::info!(worker_count, "Local worker pool started");
        Self {
            queue: StdMutex::new(Some(tx)),
            workers: StdMutex::new(workers),
            worker_count,
        }
    }
}

async fn worker_loop(id: usize, functions: Arc<FunctionRegistry>, queue: TaskQueue) {
    loop {
        let task = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(task) = task else {
            tracing::trace!(worker = id, "Task queue closed");
            break;
        };

        let DispatchTask {
            slot,
            function_name,
            channels,
            completion,
        } = task;
        tracing::debug!(worker = id, %slot, function = %function_name, "Dispatching session");

        let outcome = dispatch_contained(Arc::clone(&functions), function_name, channels).await;
        tracing::debug!(worker = id, %slot, ?outcome, "Session ended");

        completion.complete();
    }
}

#[async_trait]
impl WorkerPool for LocalWorkerPool {
    fn dispatch(&self, task: DispatchTask) -> Result<(), WorkerPoolError> {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = queue.as_ref() else {
            return Err(WorkerPoolError::ShutDown);
        };
        tx.send(task).map_err(|_| WorkerPoolError::ShutDown)
    }

    fn worker_count(&self) -> usize {
        self.worker_count
    }

    async fn shutdown(&self) {
        let tx = self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(tx);

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }
        tracing::info!("Local worker pool stopped");
    }
}
