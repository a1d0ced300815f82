//! tvfpool: isolated worker pool and resumable session protocol for
//! table-valued functions.

mod health;
mod version;

pub mod bridge;
pub mod config;
pub mod functions;
pub mod logging;
pub mod permit;
pub mod router;
pub mod service;
pub mod transport;
pub mod worker;

pub use bridge::protocol::{ExecutionId, InboundMessage, OutboundMessage, SlotIndex, StepKind};
pub use config::{ConfigError, PoolConfig, WorkerMode};
pub use functions::{Evaluation, FunctionError, FunctionRegistry, Step, TableFunction};
pub use health::Health;
pub use permit::{AdmissionController, AdmissionError, PoolSnapshot, ResizeError};
pub use router::{SessionError, SessionRouter, SessionState};
pub use service::{HealthSnapshot, PoolService, ServiceError, build_workers};
pub use version::{TVFPOOL_VERSION, VersionInfo};
pub use worker::{LocalWorkerPool, ProcessWorkerPool, WorkerPool, run_worker};
