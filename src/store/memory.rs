//! In-memory store with the same relational checks as the database schema.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::{Store, StoreError};
use crate::detector::BOUNDING_BOX_DEGREES;
use crate::models::{Anomaly, Reading};

// ---

#[derive(Default)]
struct Tables {
    readings: Vec<Reading>,
    anomalies: Vec<Anomaly>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.lock().readings.clone()
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.lock().anomalies.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        // ---
        let mut tables = self.lock();
        if tables
            .readings
            .iter()
            .any(|r| r.id == reading.id && r.timestamp == reading.timestamp)
        {
            return Err(StoreError::InvalidData(format!(
                "duplicate reading {}",
                reading.id
            )));
        }
        tables.readings.push(reading.clone());
        Ok(())
    }

    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StoreError> {
        // ---
        let mut tables = self.lock();
        if let Some(source) = anomaly.source {
            let exists = tables
                .readings
                .iter()
                .any(|r| r.id == source.id && r.timestamp == source.timestamp);
            if !exists {
                return Err(StoreError::InvalidData(format!(
                    "anomaly {} references unknown reading {}",
                    anomaly.id, source.id
                )));
            }
        }
        tables.anomalies.push(anomaly.clone());
        Ok(())
    }

    async fn query_window(
        &self,
        parameter: &str,
        latitude: f64,
        longitude: f64,
        hours: u32,
    ) -> Result<Vec<Reading>, StoreError> {
        // ---
        let since = Utc::now() - Duration::hours(hours as i64);
        let mut window: Vec<Reading> = self
            .lock()
            .readings
            .iter()
            .filter(|r| r.parameter == parameter)
            .filter(|r| (r.latitude - latitude).abs() <= BOUNDING_BOX_DEGREES)
            .filter(|r| (r.longitude - longitude).abs() <= BOUNDING_BOX_DEGREES)
            .filter(|r| r.timestamp > since)
            .cloned()
            .collect();

        window.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(window)
    }

    async fn query_recent_anomalies(&self, hours: u32) -> Result<Vec<Anomaly>, StoreError> {
        // ---
        let since = Utc::now() - Duration::hours(hours as i64);
        let mut recent: Vec<Anomaly> = self
            .lock()
            .anomalies
            .iter()
            .filter(|a| a.detected_at > since)
            .cloned()
            .collect();

        recent.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        Ok(recent)
    }
}
