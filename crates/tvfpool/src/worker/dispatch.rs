//! The dispatcher routine run by a worker for one session.

use std::sync::Arc;

use crate::bridge::channel::SlotChannels;
use crate::bridge::protocol::{SlotRequest, SlotResponse};
use crate::functions::{FunctionRegistry, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// `finish` was sent.
    Finished,
    /// `error` was sent.
    Failed,
    /// Router closed the session without a final step.
    Closed,
    /// The dispatcher panicked; a broken-channel error was sent in its place.
    Crashed,
}

/// Serve one session on `channels` until a terminal response or `Close`.
pub async fn dispatch(
    functions: &FunctionRegistry,
    function_name: &str,
    channels: &SlotChannels,
) -> DispatchOutcome {
    let (mut method, mut params) = match channels.requests.recv().await {
        Some(SlotRequest::Step { method, params }) => (method, params),
        Some(SlotRequest::Close) | None => {
            tracing::debug!(function = %function_name, "Session closed before first step");
            return DispatchOutcome::Closed;
        }
    };

    let mut evaluation = match functions.resolve(function_name) {
        Ok(evaluation) => evaluation,
        Err(e) => {
            tracing::info!(function = %function_name, error = %e, "Cannot resolve function");
            let _ = channels.responses.send(SlotResponse::Error {
                error: e.to_string(),
            });
            return DispatchOutcome::Failed;
        }
    };

    loop {
        let response = match evaluation.step(&method, params).await {
            Ok(Step::Partial(payload)) => SlotResponse::Partial { payload },
            Ok(Step::Finish(payload)) => SlotResponse::Finish { payload },
            Err(e) => SlotResponse::Error {
                error: e.to_string(),
            },
        };
        tracing::trace!(function = %function_name, kind = ?response.kind(), %method, "Step complete");

        let outcome = match response {
            SlotResponse::Partial { .. } => None,
            SlotResponse::Finish { .. } => Some(DispatchOutcome::Finished),
            SlotResponse::Error { .. } | SlotResponse::Broken { .. } => {
                Some(DispatchOutcome::Failed)
            }
        };
        // Channels own both ends, so send only fails if the pair was torn down.
        let _ = channels.responses.send(response);
        if let Some(outcome) = outcome {
            return outcome;
        }

        match channels.requests.recv().await {
            Some(SlotRequest::Step {
                method: next_method,
                params: next_params,
            }) => {
                method = next_method;
                params = next_params;
            }
            Some(SlotRequest::Close) | None => {
                tracing::debug!(function = %function_name, "Session closed between steps");
                return DispatchOutcome::Closed;
            }
        }
    }
}

/// Run `dispatch` in its own task so a panicking function cannot take the worker down.
///
/// A panic is reported on the response channel as a broken channel.
pub async fn dispatch_contained(
    functions: Arc<FunctionRegistry>,
    function_name: String,
    channels: SlotChannels,
) -> DispatchOutcome {
    let worker_channels = channels.clone();
    let name = function_name.clone();
    let handle =
        tokio::spawn(async move { dispatch(&functions, &name, &worker_channels).await });

    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(function = %function_name, error = %e, "Dispatcher crashed");
            let detail = if e.is_panic() {
                format!("function '{function_name}' panicked")
            } else {
                format!("dispatcher for '{function_name}' was cancelled")
            };
            let _ = channels.responses.send(SlotResponse::broken_channel(detail));
            DispatchOutcome::Crashed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{Evaluation, FunctionError, builtin_registry};
    use async_trait::async_trait;
    use serde_json::json;

    fn step(method: &str, params: serde_json::Value) -> SlotRequest {
        SlotRequest::Step {
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn runs_steps_until_finish() {
        let functions = builtin_registry();
        let channels = SlotChannels::new();
        channels
            .requests
            .send(step("add", json!({"value": 2})))
            .unwrap();
        channels.requests.send(step("total", json!(null))).unwrap();

        let outcome = dispatch(&functions, "accumulate", &channels).await;

        assert_eq!(outcome, DispatchOutcome::Finished);
        assert_eq!(
            channels.responses.try_recv(),
            Some(SlotResponse::Partial {
                payload: json!({"total": 2.0})
            })
        );
        assert!(matches!(
            channels.responses.try_recv(),
            Some(SlotResponse::Finish { .. })
        ));
        assert!(channels.requests.is_empty());
    }

    #[tokio::test]
    async fn unknown_function_sends_error() {
        let channels = SlotChannels::new();
        channels.requests.send(step("open", json!({}))).unwrap();

        let outcome = dispatch(&builtin_registry(), "nope", &channels).await;

        assert_eq!(outcome, DispatchOutcome::Failed);
        match channels.responses.try_recv() {
            Some(SlotResponse::Error { error }) => assert!(error.contains("not found")),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_between_steps_ends_without_response() {
        let channels = SlotChannels::new();
        channels
            .requests
            .send(step("open", json!({"stop": 10, "batch_size": 1})))
            .unwrap();
        channels.requests.send(SlotRequest::Close).unwrap();

        let outcome = dispatch(&builtin_registry(), "range", &channels).await;

        assert_eq!(outcome, DispatchOutcome::Closed);
        assert!(matches!(
            channels.responses.try_recv(),
            Some(SlotResponse::Partial { .. })
        ));
        assert!(channels.responses.is_empty());
    }

    struct Explodes;

    #[async_trait]
    impl Evaluation for Explodes {
        async fn step(
            &mut self,
            _method: &str,
            _params: serde_json::Value,
        ) -> Result<crate::functions::Step, FunctionError> {
            panic!("kaboom");
        }
    }

    #[tokio::test]
    async fn panic_is_reported_as_broken_channel() {
        let functions = FunctionRegistry::new()
            .with("explodes", || Box::new(Explodes) as Box<dyn Evaluation>);
        let channels = SlotChannels::new();
        channels.requests.send(step("go", json!(null))).unwrap();

        let outcome =
            dispatch_contained(Arc::new(functions), "explodes".to_string(), channels.clone())
                .await;

        assert_eq!(outcome, DispatchOutcome::Crashed);
        let response = channels.responses.try_recv().unwrap();
        assert!(response.is_broken_channel());
    }
}
