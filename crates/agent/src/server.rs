//! HTTP server for health and readiness endpoints

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use publisher_signer::SignatureType;

use crate::manager::BrokerTable;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    /// Live broker connections per signature type
    pub brokers: BTreeMap<String, usize>,
}

/// Shared state for health endpoints
#[derive(Clone, Default)]
pub struct ServerState {
    pipelines: Vec<(SignatureType, Arc<BrokerTable>)>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipeline(mut self, signature_type: SignatureType, table: Arc<BrokerTable>) -> Self {
        self.pipelines.push((signature_type, table));
        self
    }

    fn broker_counts(&self) -> BTreeMap<String, usize> {
        self.pipelines
            .iter()
            .map(|(signature_type, table)| (signature_type.to_string(), table.len()))
            .collect()
    }
}

/// Health endpoint - always 200 while the process serves requests
async fn health(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            brokers: state.broker_counts(),
        }),
    )
}

/// Ready endpoint - 200 only when every pipeline has a live broker
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let brokers = state.broker_counts();
    let ready = !brokers.is_empty() && brokers.values().all(|count| *count > 0);

    let (status_code, status) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no_brokers")
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            brokers,
        }),
    )
}

/// Create the health server router
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

/// Run the health server until `shutdown` fires
pub async fn run_server(
    addr: SocketAddr,
    state: ServerState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
