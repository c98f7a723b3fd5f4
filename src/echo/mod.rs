//! HTTP echo service packaged into the image the pipeline builds.

pub mod error;
pub mod handlers;
pub mod json;
pub mod middleware;

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::any, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::settings::EchoServerSettings;

const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

type HostnameFn = dyn Fn() -> io::Result<String> + Send + Sync;

#[derive(Clone)]
pub struct EchoState {
    pub hostname: Arc<HostnameFn>,
}

impl EchoState {
    pub fn new() -> Self {
        Self {
            hostname: Arc::new(system_hostname),
        }
    }
}

impl Default for EchoState {
    fn default() -> Self {
        Self::new()
    }
}

/// Kernel hostname, falling back to `$HOSTNAME` where procfs is unavailable
pub fn system_hostname() -> io::Result<String> {
    match std::fs::read_to_string(HOSTNAME_PATH) {
        Ok(name) if !name.trim().is_empty() => Ok(name.trim().to_string()),
        Ok(_) => Err(io::Error::new(io::ErrorKind::InvalidData, "empty hostname")),
        Err(err) => std::env::var("HOSTNAME")
            .ok()
            .filter(|name| !name.is_empty())
            .ok_or(err),
    }
}

pub fn router(state: EchoState) -> Router {
    Router::new()
        .route("/echo", any(handlers::echo))
        .fallback(handlers::hello)
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

pub async fn run_server(settings: &EchoServerSettings) -> Result<()> {
    let app = router(EchoState::new());

    let addr = format!("{}:{}", settings.host, settings.port);
    info!("Echo server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Echo server shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
