// src/routes/health.rs
//! Health check endpoint for the notifier surface.
//!
//! This module defines the `/health` route used by container orchestrators
//! (e.g., Docker, Kubernetes) to verify that the service is running and able
//! to respond to HTTP requests. It follows the Explicit Module Boundary
//! Pattern (EMBP):
//! - Internal to this file: endpoint handler(s) and related types
//! - Exports to the gateway (`mod.rs`): a subrouter containing the `/health` route

use axum::{routing::get, Json, Router};
use serde::Serialize;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

/// Handle `GET /health`.
///
/// Deliberately lightweight: does not touch the database, the broker, or
/// the broadcast hub.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "up",
        service: "notifier",
    })
}

/// Create a subrouter containing the `/health` route.
///
/// Generic over the application state so it merges cleanly with the
/// gateway router regardless of the state type.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/health", get(health))
}
