//! HTTP surface of the broker: control channel upgrade and operator listing

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::control::ws_handler;
use crate::registry::ClientInfo;
use crate::state::BrokerState;

/// Path of the operator listing
pub const SHOW_CLIENT_PATH: &str = "/showClient";

/// Build the broker router
pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route(SHOW_CLIENT_PATH, get(show_clients))
        .with_state(state)
}

async fn show_clients(State(state): State<Arc<BrokerState>>) -> Json<Vec<ClientInfo>> {
    Json(state.registry.list())
}

/// Serve the router on `listener` until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    state: Arc<BrokerState>,
    cancel: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!("Control channel listening on ws://{}", local_addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
    .context("HTTP server failed")?;

    tracing::info!("Control channel listener on {} stopped", local_addr);
    Ok(())
}
