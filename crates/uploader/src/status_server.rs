//! Status HTTP server
//!
//! Exposes the per-channel status snapshot for operators and dashboards.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::status::{SharedStatus, StatusSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid listen address {0:?}")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /status endpoint
/// Returns the current StatusSnapshot as JSON
async fn get_status(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let snapshot = status.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Runs the status HTTP server on `listen`
///
/// # Arguments
/// * `status` - Shared status state to serve
/// * `listen` - Socket address such as `127.0.0.1:7879`
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if server fails to start
pub async fn run_status_server(status: SharedStatus, listen: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| ServerError::InvalidAddress(listen.to_string()))?;
    let app = create_status_router(status);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "status server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
