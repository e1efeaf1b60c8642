//! PostgreSQL / TimescaleDB store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Store, StoreError};
use crate::detector::BOUNDING_BOX_DEGREES;
use crate::models::{Anomaly, AnomalyKind, Reading, ReadingRef};

// ---

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // ---
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

/// Row shape of the `anomalies` table.
#[derive(Debug, sqlx::FromRow)]
struct AnomalyRow {
    // ---
    id: Uuid,
    #[sqlx(rename = "type")]
    kind: String,
    parameter: String,
    value: f64,
    latitude: f64,
    longitude: f64,
    detected_at: DateTime<Utc>,
    air_quality_data_id: Option<Uuid>,
    air_quality_data_timestamp: Option<DateTime<Utc>>,
}

impl TryFrom<AnomalyRow> for Anomaly {
    type Error = StoreError;

    fn try_from(row: AnomalyRow) -> Result<Self, Self::Error> {
        // ---
        let kind = row
            .kind
            .parse::<AnomalyKind>()
            .map_err(StoreError::InvalidData)?;

        let source = match (row.air_quality_data_id, row.air_quality_data_timestamp) {
            (Some(id), Some(timestamp)) => Some(ReadingRef { id, timestamp }),
            _ => None,
        };

        Ok(Anomaly {
            id: row.id,
            kind,
            parameter: row.parameter,
            value: row.value,
            latitude: row.latitude,
            longitude: row.longitude,
            detected_at: row.detected_at,
            source,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO air_quality_data (id, latitude, longitude, parameter, value, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(reading.id)
        .bind(reading.latitude)
        .bind(reading.longitude)
        .bind(&reading.parameter)
        .bind(reading.value)
        .bind(reading.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO anomalies (
                id, type, parameter, value, latitude, longitude, detected_at,
                air_quality_data_id, air_quality_data_timestamp
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(anomaly.id)
        .bind(anomaly.kind.as_str())
        .bind(&anomaly.parameter)
        .bind(anomaly.value)
        .bind(anomaly.latitude)
        .bind(anomaly.longitude)
        .bind(anomaly.detected_at)
        .bind(anomaly.source.map(|r| r.id))
        .bind(anomaly.source.map(|r| r.timestamp))
        .execute(&self.pool)
        .await?;

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
        let readings = sqlx::query_as::<_, Reading>(
            r#"
            SELECT id, latitude, longitude, parameter, value, timestamp
            FROM air_quality_data
            WHERE parameter = $1
              AND latitude  BETWEEN $2 - $4 AND $2 + $4
              AND longitude BETWEEN $3 - $4 AND $3 + $4
              AND timestamp > NOW() - make_interval(hours => $5)
            ORDER BY timestamp DESC
            "#,
        )
        .bind(parameter)
        .bind(latitude)
        .bind(longitude)
        .bind(BOUNDING_BOX_DEGREES)
        .bind(hours as i32)
        .fetch_all(&self.pool)
        .await?;

        Ok(readings)
    }

    async fn query_recent_anomalies(&self, hours: u32) -> Result<Vec<Anomaly>, StoreError> {
        // ---
        let rows = sqlx::query_as::<_, AnomalyRow>(
            r#"
            SELECT id, type, parameter, value, latitude, longitude, detected_at,
                   air_quality_data_id, air_quality_data_timestamp
            FROM anomalies
            WHERE detected_at > NOW() - make_interval(hours => $1)
            ORDER BY detected_at DESC
            "#,
        )
        .bind(hours as i32)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Anomaly::try_from).collect()
    }
}
