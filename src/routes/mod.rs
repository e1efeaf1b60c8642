//! HTTP gateway for the notifier surface (EMBP).
//!
//! Each sibling module exports a subrouter; this gateway merges them and
//! attaches the shared [`AppState`], so `main.rs` never sees individual
//! endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use crate::hub::HubHandle;
use crate::store::Store;

mod alerts;
mod anomalies;
mod health;

// ---

/// State shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub hub: HubHandle,
    /// Budget for storage calls made on behalf of a request.
    pub store_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(alerts::router())
        .merge(anomalies::router())
        .merge(health::router())
        .with_state(state)
}
