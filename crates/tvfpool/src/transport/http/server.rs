//! HTTP listener for the pool service.
//!
//! The server owns no pool state. When it stops accepting connections it
//! hands over to `PoolService::stop`, which fails waiting sessions and stops
//! the workers.

use std::fmt;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::service::PoolService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Hostname or IP literal; IPv6 literals need no brackets.
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
        }
    }
}

/// What ended the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    /// `POST /shutdown` or `PoolService::trigger_shutdown`.
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Requested => "shutdown request",
        })
    }
}

/// Serve until SIGINT, SIGTERM or a shutdown request, then stop the service.
pub async fn serve(config: ServerConfig, service: Arc<PoolService>) -> anyhow::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    let pool = service.router().admission().snapshot();
    tracing::info!(
        addr = %local_addr,
        pool_size = pool.pool_size,
        max_limit = pool.max_limit,
        "Accepting sessions"
    );

    let shutdown_rx = service.shutdown_rx();
    axum::serve(listener, routes(Arc::clone(&service)))
        .with_graceful_shutdown(async move {
            let reason = shutdown_signal(shutdown_rx).await;
            tracing::info!(%reason, "Draining HTTP connections");
        })
        .await?;

    let open_sessions = service.router().session_count();
    if open_sessions > 0 {
        tracing::warn!(open_sessions, "Stopping with sessions still bound");
    }
    service.stop().await;
    tracing::info!(addr = %local_addr, "Server stopped");
    Ok(())
}

/// Resolve on the first of SIGINT, SIGTERM or a shutdown request.
///
/// # Panics
///
/// Panics if the signal handlers cannot be installed, which only happens
/// outside a correctly configured tokio runtime.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) -> ShutdownReason {
    let interrupt = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    // A dropped sender means the service is gone; only signals remain.
    let requested = async {
        while !*shutdown_rx.borrow_and_update() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => ShutdownReason::Interrupt,
        _ = terminate => ShutdownReason::Terminate,
        _ = requested => ShutdownReason::Requested,
    }
}
