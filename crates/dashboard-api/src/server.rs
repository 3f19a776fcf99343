//! Dashboard backend server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::cluster_client::ClusterClientFactory;
use crate::credential::CredentialResolver;
use crate::error::Error;
use crate::gateway::websocket_handler;
use crate::subscription::RegistryConfig;

/// Path the dashboard websocket is served on
pub const WEBSOCKET_PATH: &str = "/dashboard/api/websocket";

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Turns client tokens into cluster credentials
    pub resolver: Arc<CredentialResolver>,
    /// Builds credential-scoped cluster clients
    pub factory: Arc<dyn ClusterClientFactory>,
    /// Per-connection limits and watcher policy
    pub registry: RegistryConfig,
}

/// Build the HTTP router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(WEBSOCKET_PATH, get(websocket_handler))
        .with_state(state)
}

/// Start the server and run until Ctrl-C
pub async fn start_server(config: ServerConfig, state: AppState) -> Result<(), Error> {
    let listener = TcpListener::bind(config.addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind {}: {}", config.addr, e)))?;

    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map_err(|e| Error::Internal(format!("listener address: {}", e)))?;
    info!(addr = %addr, "Starting dashboard backend");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;

    info!("Dashboard backend stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // no signal handler available; run until the process is killed
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
