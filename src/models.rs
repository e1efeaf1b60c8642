//! Data models for the air quality anomaly pipeline.
//!
//! [`Reading`] and [`Anomaly`] travel over the broker as flat JSON objects;
//! [`Alert`] is the subscriber-facing projection of an anomaly.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

/// One timestamped sensor observation of a pollutant at a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    // ---
    pub id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub parameter: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    // ---
    pub fn new(
        latitude: f64,
        longitude: f64,
        parameter: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        // ---
        Reading {
            id: Uuid::new_v4(),
            latitude,
            longitude,
            parameter: parameter.into(),
            value,
            timestamp,
        }
    }
}

/// The closed set of anomaly classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    ThresholdExceeded,
    StatisticalOutlier,
    SpikeDetected,
    GeographicInconsistency,
}

impl AnomalyKind {
    // ---
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::ThresholdExceeded => "ThresholdExceeded",
            AnomalyKind::StatisticalOutlier => "StatisticalOutlier",
            AnomalyKind::SpikeDetected => "SpikeDetected",
            AnomalyKind::GeographicInconsistency => "GeographicInconsistency",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "ThresholdExceeded" => Ok(AnomalyKind::ThresholdExceeded),
            "StatisticalOutlier" => Ok(AnomalyKind::StatisticalOutlier),
            "SpikeDetected" => Ok(AnomalyKind::SpikeDetected),
            "GeographicInconsistency" => Ok(AnomalyKind::GeographicInconsistency),
            other => Err(format!("unknown anomaly type: {other}")),
        }
    }
}

/// Non-owning link from an anomaly back to the reading that triggered it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadingRef {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// A classified deviation detected for a specific reading.
///
/// Serialized in the flat wire shape shared with other pipeline services:
/// the back-reference becomes `air_quality_data_id` /
/// `air_quality_data_timestamp`, written as the nil UUID and year-one
/// timestamp when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "AnomalyRecord", from = "AnomalyRecord")]
pub struct Anomaly {
    // ---
    pub id: Uuid,
    pub kind: AnomalyKind,
    pub parameter: String,
    pub value: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub detected_at: DateTime<Utc>,
    pub source: Option<ReadingRef>,
}

impl Anomaly {
    // ---
    /// Build an anomaly of `kind` for `reading`, detected at `detected_at`.
    pub fn from_reading(kind: AnomalyKind, reading: &Reading, detected_at: DateTime<Utc>) -> Self {
        // ---
        Anomaly {
            id: Uuid::new_v4(),
            kind,
            parameter: reading.parameter.clone(),
            value: reading.value,
            latitude: reading.latitude,
            longitude: reading.longitude,
            detected_at,
            source: Some(ReadingRef {
                id: reading.id,
                timestamp: reading.timestamp,
            }),
        }
    }

    pub fn to_alert(&self) -> Alert {
        // ---
        Alert {
            parameter: self.parameter.clone(),
            value: self.value,
            kind: self.kind,
            location: [self.latitude, self.longitude],
            timestamp: self.detected_at,
        }
    }
}

/// Zero timestamp used on the wire for an absent back-reference.
pub fn zero_timestamp() -> DateTime<Utc> {
    // 0001-01-01T00:00:00Z
    DateTime::from_timestamp(-62_135_596_800, 0).unwrap_or_default()
}

/// Flat wire and row shape of an [`Anomaly`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    // ---
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub parameter: String,
    pub value: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub air_quality_data_id: Uuid,
    #[serde(default = "zero_timestamp")]
    pub air_quality_data_timestamp: DateTime<Utc>,
}

impl From<Anomaly> for AnomalyRecord {
    fn from(a: Anomaly) -> Self {
        // ---
        let (data_id, data_ts) = match a.source {
            Some(r) => (r.id, r.timestamp),
            None => (Uuid::nil(), zero_timestamp()),
        };
        AnomalyRecord {
            id: a.id,
            kind: a.kind,
            parameter: a.parameter,
            value: a.value,
            latitude: a.latitude,
            longitude: a.longitude,
            detected_at: a.detected_at,
            air_quality_data_id: data_id,
            air_quality_data_timestamp: data_ts,
        }
    }
}

impl From<AnomalyRecord> for Anomaly {
    fn from(r: AnomalyRecord) -> Self {
        // ---
        let source = (!r.air_quality_data_id.is_nil()).then_some(ReadingRef {
            id: r.air_quality_data_id,
            timestamp: r.air_quality_data_timestamp,
        });
        Anomaly {
            id: r.id,
            kind: r.kind,
            parameter: r.parameter,
            value: r.value,
            latitude: r.latitude,
            longitude: r.longitude,
            detected_at: r.detected_at,
            source,
        }
    }
}

/// Subscriber-facing projection of an anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    // ---
    pub parameter: String,
    pub value: f64,
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    /// `[latitude, longitude]`
    pub location: [f64; 2],
    pub timestamp: DateTime<Utc>,
}
