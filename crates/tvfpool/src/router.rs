//! Session router - create and continue multi-step sessions.
//!
//! Each session is bound to one slot from creation until it finishes, fails,
//! or is reaped. Removing a session from the map is the single point that
//! decides who releases its slot, so the release happens exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot};

use crate::bridge::channel::SlotChannels;
use crate::bridge::protocol::{
    ExecutionId, InboundMessage, OutboundMessage, SlotIndex, SlotRequest, SlotResponse, StepKind,
};
use crate::permit::{AdmissionController, AdmissionError};

/// Upper bound on waiting for a worker to hand its permit back after a final step.
const IDLE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("admission rejected: {0}")]
    AdmissionRejected(#[source] AdmissionError),
    #[error("invalid session: {0}")]
    InvalidSession(String),
    #[error("broken channel: {detail}")]
    BrokenChannel {
        execution_id: Option<ExecutionId>,
        detail: String,
    },
    #[error("{error}")]
    Function {
        execution_id: ExecutionId,
        error: String,
    },
}

impl SessionError {
    fn broken(execution_id: ExecutionId, detail: impl Into<String>) -> Self {
        Self::BrokenChannel {
            execution_id: Some(execution_id),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Continuing,
    Finished,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// How a terminated session gives its slot back.
#[derive(Debug, Clone, Copy)]
enum Reclaim {
    /// Worker is done with the pair: dirty-check and free, then wait for its permit.
    Release,
    /// Worker may still hold the pair: swap in a fresh one and free.
    Retire,
}

struct Session {
    execution_id: ExecutionId,
    slot: SlotIndex,
    function_name: String,
    channels: SlotChannels,
    /// Held for the whole of one exchange; serializes continues on a session.
    state: Arc<Mutex<SessionState>>,
    idle: StdMutex<Option<oneshot::Receiver<()>>>,
    last_activity: StdMutex<Instant>,
}

impl Session {
    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    fn take_idle(&self) -> Option<oneshot::Receiver<()>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

pub struct SessionRouter {
    admission: Arc<AdmissionController>,
    sessions: DashMap<ExecutionId, Arc<Session>>,
    poll_interval: Duration,
    closed: AtomicBool,
}

impl SessionRouter {
    pub fn new(admission: Arc<AdmissionController>, poll_interval: Duration) -> Self {
        Self {
            admission,
            sessions: DashMap::new(),
            poll_interval,
            closed: AtomicBool::new(false),
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Start a session and run its first step.
    pub async fn create(
        self: &Arc<Self>,
        function_name: &str,
        method: String,
        params: serde_json::Value,
    ) -> Result<OutboundMessage, SessionError> {
        if self.is_closed() {
            return Err(SessionError::BrokenChannel {
                execution_id: None,
                detail: "router is closed".to_string(),
            });
        }

        let started = self
            .admission
            .start_task(function_name)
            .map_err(|e| match e {
                AdmissionError::Dispatch(e) => SessionError::BrokenChannel {
                    execution_id: None,
                    detail: e.to_string(),
                },
                other => SessionError::AdmissionRejected(other),
            })?;

        let execution_id = ExecutionId::new();
        let session = Arc::new(Session {
            execution_id,
            slot: started.slot,
            function_name: function_name.to_string(),
            channels: started.channels,
            state: Arc::new(Mutex::new(SessionState::Created)),
            idle: StdMutex::new(Some(started.idle)),
            last_activity: StdMutex::new(Instant::now()),
        });
        // Lock before publishing so the reaper never sees an unclaimed new
        // session. No await between admission and the spawned exchange, so a
        // dropped caller cannot strand the slot here.
        let guard = match Arc::clone(&session.state).try_lock_owned() {
            Ok(guard) => guard,
            Err(e) => {
                let _ = session.channels.requests.send(SlotRequest::Close);
                let _ = self.admission.retire_slot(session.slot);
                return Err(SessionError::broken(execution_id, e.to_string()));
            }
        };
        self.sessions.insert(execution_id, Arc::clone(&session));
        tracing::info!(%execution_id, slot = %session.slot, function = %function_name, "Session created");

        self.spawn_exchange(session, guard, method, params).await
    }

    /// Run the next step of an existing session.
    pub async fn continue_session(
        self: &Arc<Self>,
        execution_id: &str,
        method: String,
        params: serde_json::Value,
    ) -> Result<OutboundMessage, SessionError> {
        let id = ExecutionId::parse(execution_id).map_err(|_| {
            SessionError::InvalidSession(format!("malformed execution id '{execution_id}'"))
        })?;
        let session = self
            .sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::InvalidSession(format!("unknown execution id {id}")))?;

        let guard = Arc::clone(&session.state).lock_owned().await;
        // The session may have ended while this call waited its turn.
        if guard.is_terminal() {
            return Err(SessionError::InvalidSession(format!(
                "session {id} has ended"
            )));
        }
        tracing::debug!(execution_id = %id, slot = %session.slot, %method, "Continuing session");

        self.spawn_exchange(session, guard, method, params).await
    }

    /// Route a raw inbound message by which identifying fields it carries.
    pub async fn handle(
        self: &Arc<Self>,
        message: InboundMessage,
    ) -> Result<OutboundMessage, SessionError> {
        let InboundMessage {
            function_name,
            method,
            params,
            execution_id,
        } = message;
        match (function_name, execution_id) {
            (Some(function_name), None) => self.create(&function_name, method, params).await,
            (None, Some(execution_id)) => {
                self.continue_session(&execution_id, method, params).await
            }
            (Some(_), Some(_)) => Err(SessionError::InvalidSession(
                "message carries both function_name and execution_id".to_string(),
            )),
            (None, None) => Err(SessionError::InvalidSession(
                "message carries neither function_name nor execution_id".to_string(),
            )),
        }
    }

    /// Run one exchange in a background task so the slot's lifetime does not
    /// depend on the caller. A dropped caller leaves the step to finish on
    /// its own; a partial result then leaves the session for the reaper.
    async fn spawn_exchange(
        self: &Arc<Self>,
        session: Arc<Session>,
        state: OwnedMutexGuard<SessionState>,
        method: String,
        params: serde_json::Value,
    ) -> Result<OutboundMessage, SessionError> {
        let execution_id = session.execution_id;
        let (tx, rx) = oneshot::channel();
        let router = Arc::clone(self);
        let task_session = Arc::clone(&session);
        tokio::spawn(async move {
            let result = router.exchange(&task_session, state, method, params).await;
            if tx.send(result).is_err() {
                tracing::debug!(%execution_id, "Caller went away before the step completed");
            }
        });

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                // Exchange task panicked; the session can no longer be trusted.
                let _ = session.channels.requests.send(SlotRequest::Close);
                self.end_session(&session, Reclaim::Retire).await;
                Err(SessionError::broken(execution_id, "exchange task lost"))
            }
        }
    }

    async fn exchange(
        &self,
        session: &Session,
        mut state: OwnedMutexGuard<SessionState>,
        method: String,
        params: serde_json::Value,
    ) -> Result<OutboundMessage, SessionError> {
        let execution_id = session.execution_id;
        *state = SessionState::Running;
        session.touch();

        if let Err(e) = session
            .channels
            .requests
            .send(SlotRequest::Step { method, params })
        {
            *state = SessionState::Failed;
            self.end_session(session, Reclaim::Retire).await;
            return Err(SessionError::broken(execution_id, e.to_string()));
        }

        let response = match self.await_response(session).await {
            Some(response) => response,
            None => {
                *state = SessionState::Failed;
                let _ = session.channels.requests.send(SlotRequest::Close);
                self.end_session(session, Reclaim::Retire).await;
                tracing::warn!(%execution_id, slot = %session.slot, "Session aborted, router closed");
                return Err(SessionError::broken(execution_id, "router is closed"));
            }
        };
        session.touch();

        match response {
            SlotResponse::Partial { payload } => {
                *state = SessionState::Continuing;
                tracing::debug!(%execution_id, slot = %session.slot, "Partial result");
                Ok(OutboundMessage {
                    result: StepKind::Partial,
                    payload,
                    execution_id,
                })
            }
            SlotResponse::Finish { payload } => {
                *state = SessionState::Finished;
                self.end_session(session, Reclaim::Release).await;
                tracing::info!(%execution_id, slot = %session.slot, "Session finished");
                Ok(OutboundMessage {
                    result: StepKind::Finish,
                    payload,
                    execution_id,
                })
            }
            SlotResponse::Error { error } => {
                *state = SessionState::Failed;
                self.end_session(session, Reclaim::Release).await;
                tracing::info!(%execution_id, slot = %session.slot, function = %session.function_name, %error, "Session failed");
                Err(SessionError::Function {
                    execution_id,
                    error,
                })
            }
            SlotResponse::Broken { detail } => {
                *state = SessionState::Failed;
                self.end_session(session, Reclaim::Release).await;
                tracing::warn!(%execution_id, slot = %session.slot, %detail, "Session failed on broken channel");
                Err(SessionError::broken(execution_id, detail))
            }
        }
    }

    /// Wait for the next response, one `poll_interval` per round. `None` once closed.
    async fn await_response(&self, session: &Session) -> Option<SlotResponse> {
        loop {
            if self.is_closed() {
                return None;
            }
            match tokio::time::timeout(self.poll_interval, session.channels.responses.recv()).await
            {
                Ok(Some(response)) => return Some(response),
                Ok(None) => return None,
                Err(_) => continue,
            }
        }
    }

    async fn end_session(&self, session: &Session, reclaim: Reclaim) {
        if self.sessions.remove(&session.execution_id).is_none() {
            return;
        }
        match reclaim {
            Reclaim::Release => {
                let _ = self.admission.release_slot(session.slot);
                if let Some(idle) = session.take_idle()
                    && tokio::time::timeout(IDLE_CONFIRM_TIMEOUT, idle).await.is_err()
                {
                    tracing::warn!(
                        execution_id = %session.execution_id,
                        slot = %session.slot,
                        "Worker did not confirm idle in time"
                    );
                }
            }
            Reclaim::Retire => {
                let _ = self.admission.retire_slot(session.slot);
            }
        }
    }

    /// Close and reclaim live sessions untouched for at least `idle_timeout`.
    ///
    /// Sessions with an exchange in progress hold their state lock and are
    /// skipped. An unlocked session left in RUNNING lost its exchange and is
    /// reaped like a CONTINUING one. Returns how many were reaped.
    pub fn reap_idle(&self, idle_timeout: Duration) -> usize {
        // Collect first: DashMap shards stay locked while iterating.
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut reaped = 0;
        for session in sessions {
            let Ok(mut state) = session.state.try_lock() else {
                continue;
            };
            if state.is_terminal() || session.idle_for() < idle_timeout {
                continue;
            }
            *state = SessionState::Failed;
            let _ = session.channels.requests.send(SlotRequest::Close);
            if self.sessions.remove(&session.execution_id).is_some() {
                let _ = self.admission.retire_slot(session.slot);
                reaped += 1;
                tracing::info!(
                    execution_id = %session.execution_id,
                    slot = %session.slot,
                    idle_secs = session.idle_for().as_secs(),
                    "Reaped idle session"
                );
            }
        }
        reaped
    }

    /// Fail in-flight waits at their next poll round, reclaim idle sessions, refuse new ones.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let reaped = self.reap_idle(Duration::ZERO);
        tracing::info!(reaped, remaining = self.sessions.len(), "Session router closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_slot(&self, execution_id: &ExecutionId) -> Option<SlotIndex> {
        self.sessions.get(execution_id).map(|entry| entry.slot)
    }
}
