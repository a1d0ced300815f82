//! Wire protocol types for the session protocol.
//!
//! Three layers:
//! - **API messages** (`InboundMessage`/`OutboundMessage`): what callers send and receive
//! - **Slot messages** (`SlotRequest`/`SlotResponse`): one exchange on a slot's channel pair
//! - **Worker frames** (`WorkerRequest`/`WorkerResponse`): parent <-> worker process over stdio

use serde::{Deserialize, Serialize};

/// Opaque identifier of one session.
///
/// UUID v4 so ids are never reused and cannot be guessed from slot positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(uuid::Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a slot in the slot registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one round of worker computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Partial,
    Finish,
    Error,
}

impl StepKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish | Self::Error)
    }
}

/// Request as received at the API boundary.
///
/// `function_name` without `execution_id` starts a session; `execution_id`
/// without `function_name` continues one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

/// Reply returned at the API boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub result: StepKind,
    pub payload: serde_json::Value,
    pub execution_id: ExecutionId,
}

/// Messages from router to worker on a slot's request channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotRequest {
    /// Run one evaluation step.
    Step {
        method: String,
        params: serde_json::Value,
    },

    /// End the session without a response (idle session reaped).
    Close,
}

/// Messages from worker to router on a slot's response channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotResponse {
    Partial { payload: serde_json::Value },
    Finish { payload: serde_json::Value },
    Error { error: String },
    /// The worker side went away mid-session; produced by the pool, never by a function.
    Broken { detail: String },
}

impl SlotResponse {
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Partial { .. } => StepKind::Partial,
            Self::Finish { .. } => StepKind::Finish,
            Self::Error { .. } | Self::Broken { .. } => StepKind::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    pub fn broken_channel(detail: impl std::fmt::Display) -> Self {
        Self::Broken {
            detail: detail.to_string(),
        }
    }

    pub fn is_broken_channel(&self) -> bool {
        matches!(self, Self::Broken { .. })
    }
}

/// Frames from parent to worker process (stdin).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Start serving a session for the named function.
    Dispatch { function_name: String },

    Step {
        method: String,
        params: serde_json::Value,
    },

    Close,

    Shutdown,
}

impl From<SlotRequest> for WorkerRequest {
    fn from(request: SlotRequest) -> Self {
        match request {
            SlotRequest::Step { method, params } => Self::Step { method, params },
            SlotRequest::Close => Self::Close,
        }
    }
}

/// Frames from worker process to parent (stdout).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Sent once after startup.
    Ready { pid: u32 },

    Partial { payload: serde_json::Value },

    Finish { payload: serde_json::Value },

    Error { error: String },

    Broken { detail: String },

    /// The session has ended and the worker accepts the next Dispatch.
    Idle,

    ShuttingDown,
}

impl From<SlotResponse> for WorkerResponse {
    fn from(response: SlotResponse) -> Self {
        match response {
            SlotResponse::Partial { payload } => Self::Partial { payload },
            SlotResponse::Finish { payload } => Self::Finish { payload },
            SlotResponse::Error { error } => Self::Error { error },
            SlotResponse::Broken { detail } => Self::Broken { detail },
        }
    }
}

impl WorkerResponse {
    /// Slot-level view of this frame, if it carries a step result.
    pub fn into_slot_response(self) -> Option<SlotResponse> {
        match self {
            Self::Partial { payload } => Some(SlotResponse::Partial { payload }),
            Self::Finish { payload } => Some(SlotResponse::Finish { payload }),
            Self::Error { error } => Some(SlotResponse::Error { error }),
            Self::Broken { detail } => Some(SlotResponse::Broken { detail }),
            Self::Ready { .. } | Self::Idle | Self::ShuttingDown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_execution_id() -> ExecutionId {
        ExecutionId(uuid::Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap())
    }

    #[test]
    fn execution_id_parse_rejects_garbage() {
        assert!(ExecutionId::parse("not-a-session").is_err());
        let id = test_execution_id();
        assert_eq!(ExecutionId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn slot_step_serializes() {
        let req = SlotRequest::Step {
            method: "next".to_string(),
            params: json!({"limit": 10}),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "step",
          "method": "next",
          "params": {
            "limit": 10
          }
        }
        "#);
    }

    #[test]
    fn slot_close_serializes() {
        insta::assert_json_snapshot!(SlotRequest::Close, @r#"
        {
          "type": "close"
        }
        "#);
    }

    #[test]
    fn slot_partial_serializes() {
        let resp = SlotResponse::Partial {
            payload: json!("chunk 1"),
        };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "type": "partial",
          "payload": "chunk 1"
        }
        "#);
    }

    #[test]
    fn outbound_serializes() {
        let msg = OutboundMessage {
            result: StepKind::Finish,
            payload: json!("done"),
            execution_id: test_execution_id(),
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "result": "finish",
          "payload": "done",
          "execution_id": "550e8400-e29b-41d4-a716-446655440000"
        }
        "#);
    }

    #[test]
    fn inbound_defaults_params_and_ids() {
        let msg: InboundMessage = serde_json::from_value(json!({"method": "next"})).unwrap();
        assert!(msg.function_name.is_none());
        assert!(msg.execution_id.is_none());
        assert!(msg.params.is_null());
    }

    #[test]
    fn worker_dispatch_serializes() {
        let req = WorkerRequest::Dispatch {
            function_name: "range".to_string(),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "dispatch",
          "function_name": "range"
        }
        "#);
    }

    #[test]
    fn worker_idle_has_no_slot_response() {
        assert!(WorkerResponse::Idle.into_slot_response().is_none());
        assert!(WorkerResponse::Ready { pid: 7 }.into_slot_response().is_none());
        let finish = WorkerResponse::Finish { payload: json!(1) }.into_slot_response();
        assert_eq!(finish, Some(SlotResponse::Finish { payload: json!(1) }));
    }

    #[test]
    fn broken_channel_is_detectable() {
        let resp = SlotResponse::broken_channel("worker exited");
        assert!(resp.is_broken_channel());
        assert!(resp.is_terminal());
        assert!(
            !SlotResponse::Error {
                error: "boom".to_string()
            }
            .is_broken_channel()
        );
    }

    #[test]
    fn function_error_text_never_reads_as_broken_channel() {
        let resp = SlotResponse::Error {
            error: "broken channel: x".to_string(),
        };
        assert!(!resp.is_broken_channel());
        assert_eq!(resp.kind(), StepKind::Error);
    }

    #[test]
    fn broken_serializes_and_crosses_the_worker_pipe() {
        let resp = SlotResponse::broken_channel("function 'f' panicked");
        insta::assert_json_snapshot!(resp, @r#"
        {
          "type": "broken",
          "detail": "function 'f' panicked"
        }
        "#);
        let back = WorkerResponse::from(resp.clone()).into_slot_response();
        assert_eq!(back, Some(resp));
    }
}
