//! Recent anomaly listing for dashboards.
//!
//! `GET /api/anomalies?hours=N` returns the anomalies detected in the last
//! `N` hours, newest first. Every error response carries a JSON
//! `{"error": ...}` body, including malformed query strings.

use axum::{
    extract::rejection::QueryRejection, extract::Query, extract::State, http::StatusCode,
    response::IntoResponse, response::Response, routing::get, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use super::AppState;
use crate::store::bounded;

// ---

const DEFAULT_HOURS: u32 = 24;
const MAX_HOURS: u32 = 720;

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/api/anomalies", get(handler))
}

/// Query parameters for `GET /api/anomalies`.
#[derive(Debug, Deserialize)]
pub struct AnomaliesQuery {
    /// Lookback in hours, 1..=720. Defaults to 24.
    hours: Option<u32>,
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

async fn handler(
    params: Result<Query<AnomaliesQuery>, QueryRejection>,
    State(state): State<AppState>,
) -> Response {
    // ---
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let hours = params.hours.unwrap_or(DEFAULT_HOURS);
    if !(1..=MAX_HOURS).contains(&hours) {
        return bad_request(format!("hours must be between 1 and {MAX_HOURS}"));
    }

    info!("GET /api/anomalies - last {} hour(s)", hours);

    match bounded(state.store_timeout, state.store.query_recent_anomalies(hours)).await {
        Ok(anomalies) => (StatusCode::OK, Json(anomalies)).into_response(),
        Err(e) => {
            error!("Failed to fetch anomalies: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to fetch anomalies" })),
            )
                .into_response()
        }
    }
}
