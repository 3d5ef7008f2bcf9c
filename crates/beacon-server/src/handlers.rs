//! HTTP handlers for the Beacon server.
//!
//! Only operational endpoints are served; client transports live elsewhere.

use crate::config::Settings;
use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use beacon_protocol::NodeInfo;
use serde::Serialize;
use std::sync::Arc;
use tenvis_beacon_core::Node;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// The broker node.
    pub node: Arc<Node>,
}

/// Body of `GET /info`.
#[derive(Debug, Serialize)]
pub struct InfoResponse {
    /// Uid of the answering node.
    pub uid: String,
    /// Engine name.
    pub engine: &'static str,
    /// Channels this node has engine interest in.
    pub channels: usize,
    /// This node followed by its live peers.
    pub nodes: Vec<NodeInfo>,
}

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .with_state(state)
}

/// Serve HTTP until ctrl-c.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_server(settings: &Settings, node: Arc<Node>) -> Result<()> {
    let addr = settings.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    let app = router(AppState {
        node: Arc::clone(&node),
    });

    info!("Beacon server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    node.shutdown();
    info!("Beacon server stopped");
    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Cluster and node information.
async fn info_handler(
    State(state): State<AppState>,
) -> Result<Json<InfoResponse>, (StatusCode, &'static str)> {
    let node = &state.node;
    let channels = node.engine().channels().await.map_err(|e| {
        error!(error = %e, "Listing channels failed");
        (StatusCode::INTERNAL_SERVER_ERROR, e.public_message())
    })?;

    Ok(Json(InfoResponse {
        uid: node.uid().to_string(),
        engine: node.engine().name(),
        channels: channels.len(),
        nodes: node.nodes(),
    }))
}
