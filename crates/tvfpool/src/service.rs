//! PoolService: transport-agnostic owner of the pool.
//!
//! This service owns:
//! - The session router (and through it admission and the worker pool)
//! - Health tracking
//! - The idle-session reaper
//! - Shutdown coordination (bidirectional)
//!
//! Transports hold an `Arc<PoolService>` and delegate every operation to it.

use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{InboundMessage, OutboundMessage};
use crate::config::{PoolConfig, WorkerMode};
use crate::functions::FunctionRegistry;
use crate::health::Health;
use crate::permit::{AdmissionController, PoolSnapshot, ResizeError};
use crate::router::{SessionError, SessionRouter};
use crate::version::VersionInfo;
use crate::worker::{
    CommandSpawner, LocalWorkerPool, ProcessWorkerPool, ProcessWorkerPoolConfig, SpawnError,
    WorkerPool,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service not ready ({0:?})")]
    NotReady(Health),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("resize rejected: {0}")]
    ResizeRejected(#[from] ResizeError),
}

/// Heartbeat payload.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: Health,
    pub pool: PoolSnapshot,
    pub sessions: usize,
    pub started_at: String,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status.accepts_sessions()
    }
}

/// Worker pool for the configured mode. Process workers re-run this executable.
pub fn build_workers(
    config: &PoolConfig,
    functions: Arc<FunctionRegistry>,
) -> Result<Arc<dyn WorkerPool>, SpawnError> {
    // One worker per possible permit so a resize up never waits on a worker.
    let worker_count = config.max_limit;
    let workers: Arc<dyn WorkerPool> = match config.worker_mode {
        WorkerMode::Local => Arc::new(LocalWorkerPool::new(functions, worker_count)),
        WorkerMode::Process => {
            let spawner = Arc::new(CommandSpawner::current_exe()?);
            Arc::new(ProcessWorkerPool::new(
                ProcessWorkerPoolConfig::new(spawner).with_worker_count(worker_count),
            ))
        }
    };
    Ok(workers)
}

pub struct PoolService {
    config: PoolConfig,
    router: Arc<SessionRouter>,
    health: RwLock<Health>,
    started_at: chrono::DateTime<chrono::Utc>,
    reaper: StdMutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    version: VersionInfo,
}

impl PoolService {
    pub fn new(config: PoolConfig, workers: Arc<dyn WorkerPool>) -> Self {
        let admission = Arc::new(AdmissionController::new(
            config.pool_size,
            config.max_limit,
            workers,
        ));
        let router = Arc::new(SessionRouter::new(admission, config.poll_interval));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            router,
            health: RwLock::new(Health::Unknown),
            started_at: chrono::Utc::now(),
            reaper: StdMutex::new(None),
            shutdown_tx,
            shutdown_rx,
            version: VersionInfo::new(),
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    /// Mark ready and start the idle-session reaper.
    pub async fn start(&self) {
        if let Some(idle_timeout) = self.config.idle_timeout {
            let router = Arc::clone(&self.router);
            let reap_interval = self.config.reap_interval;
            let mut shutdown_rx = self.shutdown_rx.clone();
            let reaper = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(reap_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let reaped = router.reap_idle(idle_timeout);
                            if reaped > 0 {
                                tracing::info!(reaped, "Idle sessions reaped");
                            }
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                tracing::debug!("Reaper stopped");
            });
            *self.reaper.lock().unwrap_or_else(|e| e.into_inner()) = Some(reaper);
        }

        *self.health.write().await = Health::Ready;
        tracing::info!(
            pool_size = self.config.pool_size,
            max_limit = self.config.max_limit,
            mode = ?self.config.worker_mode,
            idle_timeout = ?self.config.idle_timeout,
            "Pool service ready"
        );
    }

    /// Refuse new work, fail in-flight waits, stop the reaper and the workers.
    pub async fn stop(&self) {
        {
            let mut health = self.health.write().await;
            if *health == Health::Stopped {
                return;
            }
            *health = Health::Stopping;
        }
        self.router.close();

        let reaper = self.reaper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reaper) = reaper {
            reaper.abort();
        }

        self.router.admission().shutdown_workers().await;
        *self.health.write().await = Health::Stopped;
        tracing::info!("Pool service stopped");
    }

    async fn ensure_ready(&self) -> Result<(), ServiceError> {
        let health = *self.health.read().await;
        if health.accepts_sessions() {
            Ok(())
        } else {
            Err(ServiceError::NotReady(health))
        }
    }

    pub async fn create(
        &self,
        function_name: &str,
        method: String,
        params: serde_json::Value,
    ) -> Result<OutboundMessage, ServiceError> {
        self.ensure_ready().await?;
        Ok(self.router.create(function_name, method, params).await?)
    }

    pub async fn continue_session(
        &self,
        execution_id: &str,
        method: String,
        params: serde_json::Value,
    ) -> Result<OutboundMessage, ServiceError> {
        Ok(self
            .router
            .continue_session(execution_id, method, params)
            .await?)
    }

    pub async fn handle(&self, message: InboundMessage) -> Result<OutboundMessage, ServiceError> {
        if message.execution_id.is_none() {
            self.ensure_ready().await?;
        }
        Ok(self.router.handle(message).await?)
    }

    pub fn resize(&self, new_size: usize) -> Result<PoolSnapshot, ServiceError> {
        Ok(self.router.admission().resize(new_size)?)
    }

    pub async fn heartbeat(&self) -> HealthSnapshot {
        let pool = self.router.admission().snapshot();
        let mut status = *self.health.read().await;
        if status == Health::Ready && pool.available_permits == 0 {
            status = Health::Busy;
        }
        HealthSnapshot {
            status,
            pool,
            sessions: self.router.session_count(),
            started_at: self.started_at.to_rfc3339(),
            version: self.version.clone(),
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::StepKind;
    use crate::functions::builtin_registry;
    use serde_json::json;
    use std::time::Duration;

    fn service(config: PoolConfig) -> PoolService {
        let config = config.with_worker_mode(WorkerMode::Local);
        let workers = build_workers(&config, Arc::new(builtin_registry())).unwrap();
        PoolService::new(config, workers)
    }

    #[tokio::test]
    async fn rejects_sessions_until_started() {
        let service = service(PoolConfig::new());
        assert!(matches!(
            service.create("echo", "call".into(), json!(null)).await,
            Err(ServiceError::NotReady(Health::Unknown))
        ));

        service.start().await;
        let out = service.create("echo", "call".into(), json!(1)).await.unwrap();
        assert_eq!(out.result, StepKind::Finish);
        service.stop().await;
    }

    #[tokio::test]
    async fn heartbeat_reports_busy_at_capacity() {
        let service = service(PoolConfig::new().with_pool_size(1));
        service.start().await;
        assert_eq!(service.heartbeat().await.status, Health::Ready);

        service
            .create("range", "open".into(), json!({"stop": 10, "batch_size": 1}))
            .await
            .unwrap();

        let heartbeat = service.heartbeat().await;
        assert_eq!(heartbeat.status, Health::Busy);
        assert_eq!(heartbeat.sessions, 1);
        assert_eq!(heartbeat.pool.bound_slots, 1);
        service.stop().await;
    }

    #[tokio::test]
    async fn reaper_reclaims_abandoned_sessions() {
        let service = service(
            PoolConfig::new()
                .with_pool_size(1)
                .with_idle_timeout(Some(Duration::from_millis(20)))
                .with_reap_interval(Duration::from_millis(10)),
        );
        service.start().await;
        service
            .create("accumulate", "add".into(), json!({"value": 1}))
            .await
            .unwrap();

        for _ in 0..500 {
            if service.heartbeat().await.pool.available_permits == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let heartbeat = service.heartbeat().await;
        assert_eq!(heartbeat.sessions, 0);
        assert_eq!(heartbeat.pool.available_permits, 1);
        service.stop().await;
    }

    #[tokio::test]
    async fn resize_through_service() {
        let service = service(PoolConfig::new().with_pool_size(2).with_max_limit(4));
        service.start().await;
        assert_eq!(service.resize(4).unwrap().pool_size, 4);
        assert!(matches!(
            service.resize(5),
            Err(ServiceError::ResizeRejected(ResizeError::OutOfRange { .. }))
        ));
        service.stop().await;
    }

    #[tokio::test]
    async fn stop_refuses_new_sessions() {
        let service = service(PoolConfig::new());
        service.start().await;
        service.stop().await;

        assert_eq!(service.heartbeat().await.status, Health::Stopped);
        assert!(matches!(
            service.create("echo", "call".into(), json!(null)).await,
            Err(ServiceError::NotReady(Health::Stopped))
        ));
    }
}
