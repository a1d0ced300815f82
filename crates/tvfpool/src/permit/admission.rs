//! Admission controller - the single gate for starting sessions.
//!
//! Permits are a plain counter inside `PoolState`; the counter and the slot
//! registry change together under one mutex that is never held across an
//! await. A permit goes back only through the `Completion` of the task it
//! admitted.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use serde::Serialize;
use tokio::sync::oneshot;

use super::registry::{RegistryError, SlotRegistry};
use crate::bridge::channel::SlotChannels;
use crate::bridge::protocol::SlotIndex;
use crate::worker::{Completion, DispatchTask, WorkerPool, WorkerPoolError};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("no free permit: all {pool_size} slots are busy")]
    Rejected { pool_size: usize },
    #[error("no free slot despite an available permit")]
    NoFreeSlot,
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] WorkerPoolError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResizeError {
    #[error("pool size {requested} outside [1, {max_limit}]")]
    OutOfRange { requested: usize, max_limit: usize },
    #[error("cannot shrink to {requested}: {in_flight} sessions in flight")]
    InFlight { requested: usize, in_flight: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub pool_size: usize,
    pub max_limit: usize,
    pub available_permits: usize,
    pub bound_slots: usize,
    pub total_slots: usize,
    pub dirty_recoveries: u64,
}

/// An admitted session, already dispatched to a worker.
pub struct StartedTask {
    pub slot: SlotIndex,
    pub channels: SlotChannels,
    /// Fires right after the task's permit is back in the pool.
    pub idle: oneshot::Receiver<()>,
}

struct PoolState {
    pool_size: usize,
    max_limit: usize,
    available: usize,
    registry: SlotRegistry,
}

impl PoolState {
    fn in_flight(&self) -> usize {
        self.pool_size.saturating_sub(self.available)
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            pool_size: self.pool_size,
            max_limit: self.max_limit,
            available_permits: self.available,
            bound_slots: self.registry.in_use(),
            total_slots: self.registry.len(),
            dirty_recoveries: self.registry.dirty_recoveries(),
        }
    }
}

fn lock(state: &StdMutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct AdmissionController {
    state: Arc<StdMutex<PoolState>>,
    workers: Arc<dyn WorkerPool>,
}

impl AdmissionController {
    pub fn new(pool_size: usize, max_limit: usize, workers: Arc<dyn WorkerPool>) -> Self {
        tracing::info!(pool_size, max_limit, "Admission controller initialized");
        Self {
            state: Arc::new(StdMutex::new(PoolState {
                pool_size,
                max_limit,
                available: pool_size,
                registry: SlotRegistry::new(pool_size),
            })),
            workers,
        }
    }

    /// Admit and dispatch a session. Never blocks.
    pub fn start_task(&self, function_name: &str) -> Result<StartedTask, AdmissionError> {
        let (slot, channels) = {
            let mut state = lock(&self.state);
            if state.available == 0 {
                tracing::debug!(function = %function_name, pool_size = state.pool_size, "Admission rejected");
                return Err(AdmissionError::Rejected {
                    pool_size: state.pool_size,
                });
            }
            if state.registry.in_use() >= state.pool_size {
                tracing::warn!(
                    bound = state.registry.in_use(),
                    pool_size = state.pool_size,
                    "Permit available but bound slots at pool size"
                );
                return Err(AdmissionError::NoFreeSlot);
            }
            let Some((slot, channels)) = state.registry.acquire_free_slot() else {
                tracing::warn!(available = state.available, "Permit available but no free slot");
                return Err(AdmissionError::NoFreeSlot);
            };
            state.available -= 1;
            (slot, channels)
        };

        let (idle_tx, idle_rx) = oneshot::channel();
        let state = Arc::clone(&self.state);
        let completion = Completion::new(move || {
            lock(&state).available += 1;
            tracing::trace!(%slot, "Permit returned");
            let _ = idle_tx.send(());
        });

        let task = DispatchTask {
            slot,
            function_name: function_name.to_string(),
            channels: channels.clone(),
            completion,
        };
        // The mutex is not held here: a failed dispatch drops the task, and
        // its completion takes the lock to return the permit.
        if let Err(e) = self.workers.dispatch(task) {
            tracing::error!(%slot, function = %function_name, error = %e, "Dispatch failed");
            if let Err(release) = lock(&self.state).registry.release_slot(slot) {
                tracing::warn!(%slot, error = %release, "Release after failed dispatch");
            }
            return Err(e.into());
        }

        tracing::debug!(%slot, function = %function_name, "Session admitted");
        Ok(StartedTask {
            slot,
            channels,
            idle: idle_rx,
        })
    }

    pub fn release_slot(&self, slot: SlotIndex) -> Result<(), RegistryError> {
        let result = lock(&self.state).registry.release_slot(slot);
        if let Err(ref e) = result {
            tracing::warn!(%slot, error = %e, "Slot release failed");
        }
        result
    }

    pub fn retire_slot(&self, slot: SlotIndex) -> Result<(), RegistryError> {
        let result = lock(&self.state).registry.retire_slot(slot);
        if let Err(ref e) = result {
            tracing::warn!(%slot, error = %e, "Slot retire failed");
        }
        result
    }

    /// Change the number of permits. Rejections leave the pool untouched.
    pub fn resize(&self, new_size: usize) -> Result<PoolSnapshot, ResizeError> {
        let mut state = lock(&self.state);
        if new_size == 0 || new_size > state.max_limit {
            return Err(ResizeError::OutOfRange {
                requested: new_size,
                max_limit: state.max_limit,
            });
        }
        let in_flight = state.in_flight();
        if new_size < in_flight {
            tracing::info!(requested = new_size, in_flight, "Resize rejected");
            return Err(ResizeError::InFlight {
                requested: new_size,
                in_flight,
            });
        }

        let old_size = state.pool_size;
        state.available = new_size - in_flight;
        state.pool_size = new_size;
        let total = state.registry.len();
        if total < new_size {
            state.registry.grow(new_size - total);
        }
        tracing::info!(from = old_size, to = new_size, in_flight, "Pool resized");
        Ok(state.snapshot())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        lock(&self.state).snapshot()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.worker_count()
    }

    pub async fn shutdown_workers(&self) {
        self.workers.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Holds dispatched tasks so tests decide when they complete.
    #[derive(Default)]
    struct HoldingPool {
        tasks: StdMutex<Vec<DispatchTask>>,
        refuse: AtomicBool,
    }

    impl HoldingPool {
        fn complete_all(&self) {
            self.tasks.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl WorkerPool for HoldingPool {
        fn dispatch(&self, task: DispatchTask) -> Result<(), WorkerPoolError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(WorkerPoolError::ShutDown);
            }
            self.tasks.lock().unwrap().push(task);
            Ok(())
        }

        fn worker_count(&self) -> usize {
            usize::MAX
        }

        async fn shutdown(&self) {}
    }

    fn controller(pool_size: usize) -> (AdmissionController, Arc<HoldingPool>) {
        let pool = Arc::new(HoldingPool::default());
        let controller = AdmissionController::new(pool_size, 8, pool.clone());
        (controller, pool)
    }

    #[test]
    fn admits_up_to_pool_size_on_distinct_slots() {
        let (controller, _pool) = controller(2);

        let a = controller.start_task("f1").unwrap();
        let b = controller.start_task("f2").unwrap();
        assert_ne!(a.slot, b.slot);
        assert!(matches!(
            controller.start_task("f3"),
            Err(AdmissionError::Rejected { pool_size: 2 })
        ));
    }

    #[tokio::test]
    async fn completion_returns_permit_and_signals_idle() {
        let (controller, pool) = controller(1);
        let started = controller.start_task("f").unwrap();
        controller.release_slot(started.slot).unwrap();
        assert_eq!(controller.snapshot().available_permits, 0);

        pool.complete_all();

        started.idle.await.unwrap();
        assert_eq!(controller.snapshot().available_permits, 1);
        assert!(controller.start_task("f").is_ok());
    }

    #[test]
    fn permit_without_released_slot_is_not_admitted() {
        let (controller, pool) = controller(1);
        controller.start_task("f").unwrap();
        // Worker done, router has not released the slot yet.
        pool.complete_all();

        assert!(matches!(
            controller.start_task("f"),
            Err(AdmissionError::NoFreeSlot)
        ));
        assert_eq!(controller.snapshot().available_permits, 1);
    }

    #[test]
    fn failed_dispatch_returns_permit_and_slot() {
        let (controller, pool) = controller(1);
        pool.refuse.store(true, Ordering::SeqCst);

        assert!(matches!(
            controller.start_task("f"),
            Err(AdmissionError::Dispatch(WorkerPoolError::ShutDown))
        ));
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.available_permits, 1);
        assert_eq!(snapshot.bound_slots, 0);
    }

    #[test]
    fn resize_below_in_flight_is_rejected_without_mutation() {
        let (controller, _pool) = controller(2);
        controller.start_task("f1").unwrap();
        controller.start_task("f2").unwrap();
        let before = controller.snapshot();

        assert_eq!(
            controller.resize(1),
            Err(ResizeError::InFlight {
                requested: 1,
                in_flight: 2
            })
        );
        assert_eq!(controller.snapshot(), before);
    }

    #[test]
    fn resize_out_of_range_is_rejected() {
        let (controller, _pool) = controller(2);
        assert!(matches!(
            controller.resize(0),
            Err(ResizeError::OutOfRange { .. })
        ));
        assert!(matches!(
            controller.resize(9),
            Err(ResizeError::OutOfRange { max_limit: 8, .. })
        ));
    }

    #[test]
    fn resize_up_grows_registry_and_admits_more() {
        let (controller, _pool) = controller(2);
        controller.start_task("f1").unwrap();
        controller.start_task("f2").unwrap();

        let snapshot = controller.resize(3).unwrap();
        assert_eq!(snapshot.pool_size, 3);
        assert_eq!(snapshot.available_permits, 1);
        assert_eq!(snapshot.total_slots, 3);

        let third = controller.start_task("f3").unwrap();
        assert_eq!(third.slot.get(), 2);
        assert!(matches!(
            controller.start_task("f4"),
            Err(AdmissionError::Rejected { .. })
        ));
    }

    #[test]
    fn resize_then_exactly_k_admissions() {
        let (controller, _pool) = controller(4);
        controller.resize(2).unwrap();

        assert!(controller.start_task("a").is_ok());
        assert!(controller.start_task("b").is_ok());
        assert!(matches!(
            controller.start_task("c"),
            Err(AdmissionError::Rejected { pool_size: 2 })
        ));
    }
}
