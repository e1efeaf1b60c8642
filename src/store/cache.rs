//! Time-bounded cache in front of window queries.
//!
//! Window results are kept for `ttl` per (parameter, location, lookback).
//! Readings written through the cache are folded into every cached window
//! whose bounding box contains them, so a cached window matches what a fresh
//! query would return apart from writes made by other processes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{Store, StoreError};
use crate::detector::BOUNDING_BOX_DEGREES;
use crate::models::{Anomaly, Reading};

// ---

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    parameter: String,
    latitude_bits: u64,
    longitude_bits: u64,
    hours: u32,
}

struct CachedWindow {
    latitude: f64,
    longitude: f64,
    fetched_at: Instant,
    readings: Vec<Reading>,
}

pub struct CachedWindowStore<S> {
    inner: S,
    ttl: Duration,
    windows: DashMap<WindowKey, CachedWindow>,
}

impl<S: Store> CachedWindowStore<S> {
    // ---
    pub fn new(inner: S, ttl: Duration) -> Self {
        CachedWindowStore {
            inner,
            ttl,
            windows: DashMap::new(),
        }
    }

    /// Number of windows currently held, fresh or not.
    pub fn cached_windows(&self) -> usize {
        self.windows.len()
    }

    fn evict_expired(&self) {
        let ttl = self.ttl;
        self.windows.retain(|_, w| w.fetched_at.elapsed() < ttl);
    }
}

#[async_trait]
impl<S: Store> Store for CachedWindowStore<S> {
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        // ---
        self.inner.insert_reading(reading).await?;

        for mut entry in self.windows.iter_mut() {
            if entry.key().parameter != reading.parameter {
                continue;
            }
            let window = entry.value_mut();
            if (window.latitude - reading.latitude).abs() <= BOUNDING_BOX_DEGREES
                && (window.longitude - reading.longitude).abs() <= BOUNDING_BOX_DEGREES
            {
                window.readings.insert(0, reading.clone());
            }
        }
        Ok(())
    }

    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StoreError> {
        self.inner.insert_anomaly(anomaly).await
    }

    async fn query_window(
        &self,
        parameter: &str,
        latitude: f64,
        longitude: f64,
        hours: u32,
    ) -> Result<Vec<Reading>, StoreError> {
        // ---
        let key = WindowKey {
            parameter: parameter.to_string(),
            latitude_bits: latitude.to_bits(),
            longitude_bits: longitude.to_bits(),
            hours,
        };

        if let Some(window) = self.windows.get(&key) {
            if window.fetched_at.elapsed() < self.ttl {
                let since = Utc::now() - chrono::Duration::hours(hours as i64);
                return Ok(window
                    .readings
                    .iter()
                    .filter(|r| r.timestamp > since)
                    .cloned()
                    .collect());
            }
        }

        self.evict_expired();
        let readings = self
            .inner
            .query_window(parameter, latitude, longitude, hours)
            .await?;
        self.windows.insert(
            key,
            CachedWindow {
                latitude,
                longitude,
                fetched_at: Instant::now(),
                readings: readings.clone(),
            },
        );
        Ok(readings)
    }

    async fn query_recent_anomalies(&self, hours: u32) -> Result<Vec<Anomaly>, StoreError> {
        self.inner.query_recent_anomalies(hours).await
    }
}
