//! Health endpoint.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::sessions::SessionRegistry;

#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<SessionRegistry>,
    pub daw_host: String,
    pub daw_port: u16,
    pub started_at: Instant,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<HealthState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sessions": state.registry.count(),
        "daw": {
            "host": state.daw_host,
            "port": state.daw_port,
        },
    }))
}
