//! Process-backed worker pool.
//!
//! Each worker is a runner task owning at most one child process. The child
//! is spawned lazily on first use and respawned after it dies. Session traffic
//! is pumped between the slot's channel pair and the child's stdio as
//! length-delimited JSON frames.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{DispatchTask, WorkerPool, WorkerPoolError};
use crate::bridge::channel::SlotChannels;
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{SlotRequest, SlotResponse, WorkerRequest, WorkerResponse};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for how worker processes are launched.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Runs a program with piped stdin/stdout and inherited stderr.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// The running executable's own `worker` subcommand.
    pub fn current_exe() -> Result<Self, SpawnError> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

pub struct ProcessWorkerPoolConfig {
    pub worker_count: usize,
    pub ready_timeout: Duration,
    pub shutdown_grace: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl ProcessWorkerPoolConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            worker_count: 1,
            ready_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            spawner,
        }
    }

    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[derive(Debug, thiserror::Error)]
enum PumpError {
    #[error("worker pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker process exited mid-session")]
    Exited,
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

struct WorkerProcess {
    child: Child,
    pid: u32,
    writer: FramedWrite<ChildStdin, JsonCodec<WorkerRequest>>,
    reader: FramedRead<ChildStdout, JsonCodec<WorkerResponse>>,
}

impl WorkerProcess {
    async fn start(
        spawner: &dyn WorkerSpawner,
        ready_timeout: Duration,
    ) -> Result<Self, WorkerPoolError> {
        let mut child = spawner
            .spawn()
            .map_err(|e| WorkerPoolError::Spawn(format!("spawner failed: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerPoolError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerPoolError::Spawn("stdout not captured".to_string()))?;

        let writer = FramedWrite::new(stdin, JsonCodec::<WorkerRequest>::new());
        let mut reader = FramedRead::new(stdout, JsonCodec::<WorkerResponse>::new());

        tracing::debug!("Waiting for Ready from worker process");
        let ready = tokio::time::timeout(ready_timeout, async {
            loop {
                match reader.next().await {
                    Some(Ok(WorkerResponse::Ready { pid })) => return Ok(pid),
                    Some(Ok(other)) => {
                        tracing::warn!(?other, "Unexpected message before Ready");
                    }
                    Some(Err(e)) => {
                        return Err(WorkerPoolError::Spawn(format!("reading Ready: {e}")));
                    }
                    None => {
                        return Err(WorkerPoolError::Spawn(
                            "worker exited before Ready".to_string(),
                        ));
                    }
                }
            }
        })
        .await;

        let pid = match ready {
            Ok(Ok(pid)) => pid,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(WorkerPoolError::Spawn(format!(
                    "worker not ready after {ready_timeout:?}"
                )));
            }
        };

        tracing::info!(pid, "Worker process ready");
        Ok(Self {
            child,
            pid,
            writer,
            reader,
        })
    }

    /// Pump one session. Returns once the child reports Idle.
    async fn serve(
        &mut self,
        function_name: &str,
        channels: &SlotChannels,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), PumpError> {
        self.writer
            .send(WorkerRequest::Dispatch {
                function_name: function_name.to_string(),
            })
            .await?;

        // Stop forwarding requests once the session ended on our side; the
        // slot may already be bound to the next session.
        let mut session_open = true;
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => return Err(PumpError::ShuttingDown),

                frame = self.reader.next() => match frame {
                    Some(Ok(WorkerResponse::Idle)) => return Ok(()),
                    Some(Ok(response)) => match response.into_slot_response() {
                        Some(response) => {
                            if response.is_terminal() {
                                session_open = false;
                            }
                            let _ = channels.responses.send(response);
                        }
                        None => tracing::warn!(pid = self.pid, "Unexpected control frame mid-session"),
                    },
                    Some(Err(e)) => return Err(PumpError::Io(e)),
                    None => return Err(PumpError::Exited),
                },

                request = channels.requests.recv(), if session_open => {
                    let Some(request) = request else {
                        return Err(PumpError::Exited);
                    };
                    if matches!(request, SlotRequest::Close) {
                        session_open = false;
                    }
                    self.writer.send(WorkerRequest::from(request)).await?;
                }
            }
        }
    }

    fn log_exit_status(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => tracing::warn!(pid = self.pid, %status, "Worker process exited"),
            Ok(None) => {}
            Err(e) => tracing::warn!(pid = self.pid, error = %e, "Cannot read worker exit status"),
        }
    }

    async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(pid = self.pid, error = %e, "Failed to kill worker process");
        }
    }

    /// Ask the child to exit; escalate to SIGTERM then SIGKILL after `grace`.
    async fn stop(mut self, grace: Duration) {
        let _ = self.writer.send(WorkerRequest::Shutdown).await;
        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
            tracing::debug!(pid = self.pid, %status, "Worker process exited");
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            tracing::warn!(pid = self.pid, "Worker did not exit, sending SIGTERM");
            if kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM).is_ok()
                && let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await
            {
                tracing::debug!(pid = self.pid, %status, "Worker process exited");
                return;
            }
        }

        tracing::warn!(pid = self.pid, "Killing worker process");
        self.kill().await;
    }
}

type TaskQueue = Arc<Mutex<mpsc::UnboundedReceiver<DispatchTask>>>;

struct RunnerContext {
    spawner: Arc<dyn WorkerSpawner>,
    ready_timeout: Duration,
    shutdown_grace: Duration,
}

async fn runner_loop(
    id: usize,
    ctx: Arc<RunnerContext>,
    queue: TaskQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut process: Option<WorkerProcess> = None;

    loop {
        let task = tokio::select! {
            biased;
            _ = shutdown.changed() => None,
            task = async { queue.lock().await.recv().await } => task,
        };
        let Some(task) = task else {
            break;
        };
        // `completion` lives to the end of this iteration and fires on drop.
        let DispatchTask {
            slot,
            function_name,
            channels,
            completion: _completion,
        } = task;

        if process.is_none() {
            match WorkerProcess::start(ctx.spawner.as_ref(), ctx.ready_timeout).await {
                Ok(started) => process = Some(started),
                Err(e) => {
                    tracing::error!(worker = id, error = %e, "Cannot start worker process");
                    let _ = channels.responses.send(SlotResponse::broken_channel(&e));
                    continue;
                }
            }
        }
        let Some(worker) = process.as_mut() else {
            continue;
        };

        tracing::debug!(worker = id, pid = worker.pid, %slot, function = %function_name, "Dispatching session");
        match worker.serve(&function_name, &channels, &mut shutdown).await {
            Ok(()) => tracing::debug!(worker = id, %slot, "Session ended"),
            Err(PumpError::ShuttingDown) => {
                let _ = channels
                    .responses
                    .send(SlotResponse::broken_channel(PumpError::ShuttingDown));
                break;
            }
            Err(e) => {
                tracing::warn!(worker = id, %slot, error = %e, "Worker process lost mid-session");
                worker.log_exit_status();
                let _ = channels.responses.send(SlotResponse::broken_channel(&e));
                if let Some(dead) = process.take() {
                    dead.kill().await;
                }
            }
        }
    }

    if let Some(worker) = process {
        worker.stop(ctx.shutdown_grace).await;
    }
    tracing::trace!(worker = id, "Runner stopped");
}

pub struct ProcessWorkerPool {
    queue: StdMutex<Option<mpsc::UnboundedSender<DispatchTask>>>,
    shutdown_tx: watch::Sender<bool>,
    runners: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl ProcessWorkerPool {
    /// Start the runners. Processes are spawned on first dispatch.
    pub fn new(config: ProcessWorkerPoolConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx: TaskQueue = Arc::new(Mutex::new(rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(RunnerContext {
            spawner: config.spawner,
            ready_timeout: config.ready_timeout,
            shutdown_grace: config.shutdown_grace,
        });

        let runners = (0..config.worker_count)
            .map(|id| {
                tokio::spawn(runner_loop(
                    id,
                    Arc::clone(&ctx),
                    Arc::clone(&rx),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        tracing::info!(worker_count = config.worker_count, "Process worker pool started");
        Self {
            queue: StdMutex::new(Some(tx)),
            shutdown_tx,
            runners: Mutex::new(runners),
            worker_count: config.worker_count,
        }
    }
}

#[async_trait]
impl WorkerPool for ProcessWorkerPool {
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
        drop(self.queue.lock().unwrap_or_else(|e| e.into_inner()).take());
        let _ = self.shutdown_tx.send(true);

        let runners = std::mem::take(&mut *self.runners.lock().await);
        for runner in runners {
            if let Err(e) = runner.await {
                tracing::warn!(error = %e, "Runner task failed");
            }
        }
        tracing::info!("Process worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MissingBinary;

    impl WorkerSpawner for MissingBinary {
        fn spawn(&self) -> Result<Child, SpawnError> {
            let child = Command::new("/nonexistent/tvfpool-worker")
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .spawn()?;
            Ok(child)
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_as_broken_channel() {
        use crate::bridge::protocol::SlotIndex;
        use crate::worker::Completion;

        let pool = ProcessWorkerPool::new(ProcessWorkerPoolConfig::new(Arc::new(MissingBinary)));
        let channels = SlotChannels::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        pool.dispatch(DispatchTask {
            slot: SlotIndex::new(0),
            function_name: "echo".into(),
            channels: channels.clone(),
            completion: Completion::new(move || {
                let _ = done_tx.send(());
            }),
        })
        .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(5), channels.responses.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(response.is_broken_channel());
        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .unwrap()
            .unwrap();

        pool.shutdown().await;
    }

    #[test]
    fn runner_future_is_send() {
        fn assert_send<T: Send>(_: T) {}

        let (_tx, rx) = mpsc::unbounded_channel::<DispatchTask>();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(RunnerContext {
            spawner: Arc::new(MissingBinary),
            ready_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
        });
        assert_send(runner_loop(0, ctx, Arc::new(Mutex::new(rx)), shutdown_rx));
    }

    #[test]
    fn command_spawner_collects_args() {
        let spawner = CommandSpawner::new("/bin/tvfpool").arg("worker");
        assert_eq!(spawner.program, PathBuf::from("/bin/tvfpool"));
        assert_eq!(spawner.args, vec!["worker".to_string()]);
    }
}
