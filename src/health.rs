//! Health endpoints served next to the bridge.
//!
//! `GET /` names the service. `GET /health/live` and `GET /health/ready` both
//! report broker health as `{"AMQP": bool}`; liveness always answers 200,
//! readiness answers 503 while the bridge is not consuming.

use std::future::Future;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::bridge::BridgeHealth;

pub const SERVICE_NAME: &str = "amqp2http";

#[derive(Debug, Serialize)]
struct ServiceInfo {
    name: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    #[serde(rename = "AMQP")]
    amqp: bool,
}

pub fn health_router(health: BridgeHealth) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .with_state(health)
}

/// Serve [`health_router`] on `listener` until `shutdown` resolves.
pub async fn serve_health<F>(
    listener: TcpListener,
    health: BridgeHealth,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "health endpoints listening");
    }
    axum::serve(listener, health_router(health))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn service_info() -> Json<ServiceInfo> {
    Json(ServiceInfo { name: SERVICE_NAME })
}

async fn live(State(health): State<BridgeHealth>) -> Json<HealthReport> {
    Json(HealthReport {
        amqp: health.is_healthy(),
    })
}

async fn ready(State(health): State<BridgeHealth>) -> (StatusCode, Json<HealthReport>) {
    let amqp = health.is_healthy();
    let status = if amqp {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(HealthReport { amqp }))
}
