//! Worker pool - runs the dispatcher routine for admitted sessions.
//!
//! Two implementations share the same dispatcher:
//! - `LocalWorkerPool`: in-process tasks (embedding, tests)
//! - `ProcessWorkerPool`: one child process per worker, JSON frames over stdio
//!
//! The child-side loop of a process worker lives in `child`.

pub mod child;
mod dispatch;
mod local;
mod process;

use async_trait::async_trait;

use crate::bridge::channel::SlotChannels;
use crate::bridge::protocol::SlotIndex;

pub use child::{run_worker, run_worker_io};
pub use dispatch::{DispatchOutcome, dispatch, dispatch_contained};
pub use local::LocalWorkerPool;
pub use process::{
    CommandSpawner, ProcessWorkerPool, ProcessWorkerPoolConfig, SpawnError, WorkerSpawner,
};

/// Callback that runs exactly once when a dispatched task ends.
///
/// Fires on drop, so every exit path (normal return, panic unwinding,
/// task dropped on a closed queue) completes it.
#[must_use = "dropping a Completion fires it immediately"]
pub struct Completion {
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl Completion {
    pub fn new(on_complete: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_complete: Some(Box::new(on_complete)),
        }
    }

    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete();
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.on_complete.is_some())
            .finish()
    }
}

/// One admitted session handed to the pool.
pub struct DispatchTask {
    pub slot: SlotIndex,
    pub function_name: String,
    pub channels: SlotChannels,
    pub completion: Completion,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is shut down")]
    ShutDown,
    #[error("failed to start worker: {0}")]
    Spawn(String),
}

#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Hand a task to an idle worker. Never blocks.
    ///
    /// On error the task is dropped, which fires its completion.
    fn dispatch(&self, task: DispatchTask) -> Result<(), WorkerPoolError>;

    fn worker_count(&self) -> usize;

    /// Stop all workers. Dispatches after shutdown fail with `ShutDown`.
    async fn shutdown(&self);
}
