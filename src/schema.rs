//! Database schema management for `airwatch-pipeline`.
//!
//! Ensures required tables exist before any loop starts.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::{Context, Result};
use sqlx::PgPool;

// ---

/// One schema statement and whether startup depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Required(&'static str),
    /// Logged and skipped on failure.
    BestEffort(&'static str),
}

/// Schema statements in execution order.
///
/// `air_quality_data` becomes a hypertable before `anomalies` references it;
/// TimescaleDB does not convert a table that is already the target of a
/// foreign key.
const STEPS: [(&str, Step); 5] = [
    (
        "air_quality_data table",
        Step::Required(
            r#"
            CREATE TABLE IF NOT EXISTS air_quality_data (
                id          UUID             NOT NULL,
                latitude    DOUBLE PRECISION NOT NULL,
                longitude   DOUBLE PRECISION NOT NULL,
                parameter   TEXT             NOT NULL,
                value       DOUBLE PRECISION NOT NULL,
                timestamp   TIMESTAMPTZ      NOT NULL,
                PRIMARY KEY (id, timestamp)
            );
            "#,
        ),
    ),
    (
        "air_quality_data hypertable",
        Step::BestEffort(
            r#"
            SELECT create_hypertable('air_quality_data', 'timestamp', if_not_exists => TRUE);
            "#,
        ),
    ),
    // Window lookups filter on parameter and time
    (
        "air_quality_data index",
        Step::Required(
            r#"
            CREATE INDEX IF NOT EXISTS idx_air_quality_data_parameter_time
                ON air_quality_data (parameter, timestamp DESC);
            "#,
        ),
    ),
    (
        "anomalies table",
        Step::Required(
            r#"
            CREATE TABLE IF NOT EXISTS anomalies (
                id                          UUID             NOT NULL,
                type                        TEXT             NOT NULL,
                parameter                   TEXT             NOT NULL,
                value                       DOUBLE PRECISION NOT NULL,
                latitude                    DOUBLE PRECISION NOT NULL,
                longitude                   DOUBLE PRECISION NOT NULL,
                detected_at                 TIMESTAMPTZ      NOT NULL,
                air_quality_data_id         UUID,
                air_quality_data_timestamp  TIMESTAMPTZ,
                PRIMARY KEY (id, detected_at),
                FOREIGN KEY (air_quality_data_id, air_quality_data_timestamp)
                    REFERENCES air_quality_data (id, timestamp)
            );
            "#,
        ),
    ),
    (
        "anomalies index",
        Step::Required(
            r#"
            CREATE INDEX IF NOT EXISTS idx_anomalies_detected_at
                ON anomalies (detected_at DESC);
            "#,
        ),
    ),
];

/// Create or update the database schema (idempotent).
///
/// Creates the `air_quality_data` table for raw readings and the `anomalies`
/// table for detections, whose back-reference is a foreign key into
/// `air_quality_data`. Safe to call on every startup; no-op if objects
/// already exist.
///
/// Errors are propagated if any required statement fails. Hypertable
/// conversion is attempted and only logged on failure, so a plain PostgreSQL
/// server without the TimescaleDB extension still works.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    for (name, step) in STEPS {
        match step {
            Step::Required(sql) => {
                sqlx::query(sql)
                    .execute(pool)
                    .await
                    .with_context(|| format!("Failed to create {}", name))?;
            }
            Step::BestEffort(sql) => {
                if let Err(e) = sqlx::query(sql).execute(pool).await {
                    tracing::warn!("Skipping {}, continuing with a plain table: {}", name, e);
                }
            }
        }
    }

    tracing::info!("Database schema ready");
    Ok(())
}
