//! Persistence gateway for readings and anomalies.
//!
//! The pipeline talks to storage only through [`Store`]. The production
//! implementation is [`PgStore`] (PostgreSQL / TimescaleDB via sqlx);
//! [`MemoryStore`] backs tests and local runs, and [`CachedWindowStore`]
//! optionally wraps either one to serve repeated window queries from memory.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Anomaly, Reading};

mod cache;
mod memory;
mod postgres;

pub use cache::CachedWindowStore;
pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed (sqlx error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The call did not complete within the caller's budget.
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    /// Stored data could not be mapped back to a model, or a write violated
    /// a relational constraint.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Storage operations consumed by the pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError>;

    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StoreError>;

    /// Readings for `parameter` inside the bounding box around
    /// `(latitude, longitude)` from the last `hours` hours, newest first.
    async fn query_window(
        &self,
        parameter: &str,
        latitude: f64,
        longitude: f64,
        hours: u32,
    ) -> Result<Vec<Reading>, StoreError>;

    /// Anomalies detected in the last `hours` hours, newest first.
    async fn query_recent_anomalies(&self, hours: u32) -> Result<Vec<Anomaly>, StoreError>;
}

/// Run a storage call under a time budget.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    // ---
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
