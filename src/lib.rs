//! Streaming anomaly pipeline for geotagged air quality readings.
//!
//! Raw readings are consumed from a broker stream, stored, checked against
//! their recent history by the [`detector`], and any anomaly is stored and
//! republished. The notifier side consumes those anomalies and fans them out
//! to live WebSocket subscribers through the [`hub`].
//!
//! Module boundaries follow EMBP: each module exposes a small gateway and
//! keeps its internals private.

pub mod backoff;
pub mod broker;
pub mod config;
pub mod detector;
pub mod hub;
pub mod models;
pub mod processor;
pub mod routes;
pub mod schema;
pub mod store;

pub use config::Config;
pub use models::{Alert, Anomaly, AnomalyKind, Reading};
