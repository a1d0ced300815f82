//! Worker process side: serve sessions over stdin/stdout.
//!
//! Lifecycle:
//! 1. Send Ready with our pid
//! 2. For each Dispatch, run the dispatcher against a local channel pair and
//!    relay Step/Close frames in and step results out
//! 3. Send Idle when the dispatcher returns
//! 4. Exit on Shutdown or when the parent closes stdin

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::dispatch_contained;
use crate::bridge::channel::SlotChannels;
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{SlotRequest, WorkerRequest, WorkerResponse};
use crate::functions::FunctionRegistry;

enum SessionEnd {
    Idle,
    Shutdown,
    ParentGone,
}

/// Entry point for the `worker` subcommand.
pub async fn run_worker(functions: Arc<FunctionRegistry>) -> std::io::Result<()> {
    run_worker_io(functions, tokio::io::stdin(), tokio::io::stdout()).await
}

pub async fn run_worker_io<R, W>(
    functions: Arc<FunctionRegistry>,
    input: R,
    output: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(input, JsonCodec::<WorkerRequest>::new());
    let mut writer = FramedWrite::new(output, JsonCodec::<WorkerResponse>::new());

    writer
        .send(WorkerResponse::Ready {
            pid: std::process::id(),
        })
        .await?;
    tracing::info!(functions = ?functions.names(), "Worker ready");

    loop {
        match reader.next().await {
            Some(Ok(WorkerRequest::Dispatch { function_name })) => {
                tracing::debug!(function = %function_name, "Session started");
                let end = serve_session(
                    Arc::clone(&functions),
                    function_name,
                    &mut reader,
                    &mut writer,
                )
                .await?;
                match end {
                    SessionEnd::Idle => writer.send(WorkerResponse::Idle).await?,
                    SessionEnd::Shutdown => {
                        writer.send(WorkerResponse::ShuttingDown).await?;
                        break;
                    }
                    SessionEnd::ParentGone => {
                        tracing::info!("Parent closed the pipe mid-session");
                        break;
                    }
                }
            }
            Some(Ok(WorkerRequest::Shutdown)) => {
                writer.send(WorkerResponse::ShuttingDown).await?;
                break;
            }
            Some(Ok(other)) => tracing::warn!(?other, "Request outside of a session, ignoring"),
            Some(Err(e)) => return Err(e),
            None => {
                tracing::info!("Parent closed the pipe");
                break;
            }
        }
    }

    tracing::info!("Worker exiting");
    Ok(())
}

async fn serve_session<R, W>(
    functions: Arc<FunctionRegistry>,
    function_name: String,
    reader: &mut FramedRead<R, JsonCodec<WorkerRequest>>,
    writer: &mut FramedWrite<W, JsonCodec<WorkerResponse>>,
) -> std::io::Result<SessionEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let channels = SlotChannels::new();
    let mut dispatcher = tokio::spawn(dispatch_contained(
        functions,
        function_name,
        channels.clone(),
    ));

    loop {
        tokio::select! {
            biased;

            response = channels.responses.recv() => {
                if let Some(response) = response {
                    writer.send(WorkerResponse::from(response)).await?;
                }
            }

            outcome = &mut dispatcher => {
                while let Some(response) = channels.responses.try_recv() {
                    writer.send(WorkerResponse::from(response)).await?;
                }
                match outcome {
                    Ok(outcome) => tracing::debug!(?outcome, "Session ended"),
                    Err(e) => tracing::error!(error = %e, "Dispatcher task failed"),
                }
                return Ok(SessionEnd::Idle);
            }

            frame = reader.next() => match frame {
                Some(Ok(WorkerRequest::Step { method, params })) => {
                    let _ = channels.requests.send(SlotRequest::Step { method, params });
                }
                Some(Ok(WorkerRequest::Close)) => {
                    let _ = channels.requests.send(SlotRequest::Close);
                }
                Some(Ok(WorkerRequest::Shutdown)) => {
                    dispatcher.abort();
                    return Ok(SessionEnd::Shutdown);
                }
                Some(Ok(WorkerRequest::Dispatch { function_name })) => {
                    tracing::warn!(function = %function_name, "Dispatch while a session is active, ignoring");
                }
                Some(Err(e)) => {
                    dispatcher.abort();
                    return Err(e);
                }
                None => {
                    dispatcher.abort();
                    return Ok(SessionEnd::ParentGone);
                }
            },
        }
    }
}
