use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState};

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub dev_mode: bool,
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Serve until Ctrl-C, then stop the build queue, cancelling running jobs.
pub async fn start_server(config: ServerConfig, state: Arc<AppState>) -> Result<()> {
    let app = build_router(Arc::clone(&state), config.dev_mode);

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "nginx-automake listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.queue.shutdown().await;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
