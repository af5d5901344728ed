use super::handlers::*;
use crate::node::CoordinatorHandle;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;

pub struct RpcServer {
    addr: SocketAddr,
}

impl RpcServer {
    pub fn new(port: u16) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        Self { addr }
    }

    pub fn router(coordinator: CoordinatorHandle) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/status", post(status))
            .route("/input-registration", post(input_registration))
            .route("/input-unregistration", post(input_unregistration))
            .route("/connection-confirmation", post(connection_confirmation))
            .route("/output-registration", post(output_registration))
            .route("/ready-to-sign", post(ready_to_sign))
            .route("/transaction-signature", post(transaction_signature))
            .layer(TraceLayer::new_for_http())
            .with_state(coordinator)
    }

    pub async fn run(self, coordinator: CoordinatorHandle) -> Result<()> {
        let app = Self::router(coordinator);

        tracing::info!("RPC server listening on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
