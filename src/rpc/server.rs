use super::handlers::*;
use super::types::API_PREFIX;
use crate::coordinator::Coordinator;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    let api = Router::new()
        .route("/states", get(get_states))
        .route("/round-state/:round_id", get(get_round_state))
        .route("/nonces/:round_id", post(post_nonces))
        .route("/inputs", post(post_inputs))
        .route("/confirmation", post(post_confirmation))
        .route("/unconfirmation", post(post_unconfirmation))
        .route("/output", post(post_output))
        .route("/coinjoin/:round_id", get(get_coinjoin))
        .route("/signatures", post(post_signatures));

    Router::new()
        .route("/health", get(health))
        .nest(API_PREFIX, api)
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

pub struct RpcServer {
    addr: SocketAddr,
}

impl RpcServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn run(self, coordinator: Arc<Coordinator>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        serve(listener, coordinator, shutdown).await
    }
}

/// Serve the API on an already bound listener until `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    tracing::info!("RPC server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}
