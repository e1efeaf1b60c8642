//! Anomaly detection rules.
//!
//! Detection is a pure function over a reading and its historical window.
//! Rules are evaluated in a fixed priority order and the first rule that
//! flags wins; rules are never combined or scored jointly:
//!
//! 1. threshold exceedance against regulatory limits
//! 2. statistical outlier (population z-score)
//! 3. spike against the window mean
//! 4. geographic inconsistency against the median of nearby readings
//!
//! A window that cannot produce a verdict (too short, zero spread,
//! non-finite statistics) is treated as "no anomaly" for that rule.

use chrono::{DateTime, Utc};

use crate::models::{Anomaly, AnomalyKind, Reading};

// ---

/// Half-width in degrees of the bounding box used as a ~25 km radius proxy.
pub const BOUNDING_BOX_DEGREES: f64 = 0.25;

/// Lookback of the historical window, in hours.
pub const WINDOW_HOURS: u32 = 24;

const OUTLIER_MIN_WINDOW: usize = 10;
const OUTLIER_Z_SCORE: f64 = 3.0;

const SPIKE_MIN_WINDOW: usize = 5;
const SPIKE_FACTOR: f64 = 1.5;

const GEO_MIN_NEARBY: usize = 3;
const GEO_FACTOR: f64 = 3.0;

type Rule = fn(&Reading, &[Reading]) -> bool;

/// Detection rules in priority order.
const RULES: [(AnomalyKind, Rule); 4] = [
    (AnomalyKind::ThresholdExceeded, threshold_exceeded),
    (AnomalyKind::StatisticalOutlier, statistical_outlier),
    (AnomalyKind::SpikeDetected, spike_detected),
    (AnomalyKind::GeographicInconsistency, geographic_inconsistency),
];

/// WHO limits (μg/m³) for the parameters we have a regulatory limit for.
pub fn regulatory_limit(parameter: &str) -> Option<f64> {
    // ---
    match parameter {
        "PM2.5" => Some(15.0),
        "PM10" => Some(45.0),
        "NO2" => Some(25.0),
        "O3" => Some(100.0),
        _ => None,
    }
}

/// Whether `(latitude, longitude)` lies inside the bounding box around `center`.
pub fn within_bounding_box(center: &Reading, latitude: f64, longitude: f64) -> bool {
    (center.latitude - latitude).abs() <= BOUNDING_BOX_DEGREES
        && (center.longitude - longitude).abs() <= BOUNDING_BOX_DEGREES
}

/// Classify `reading` against `window`, stamping the current time.
pub fn detect(reading: &Reading, window: &[Reading]) -> Option<Anomaly> {
    detect_at(reading, window, Utc::now())
}

/// Classify `reading` against `window` with an explicit detection time.
pub fn detect_at(reading: &Reading, window: &[Reading], now: DateTime<Utc>) -> Option<Anomaly> {
    // ---
    RULES
        .iter()
        .find(|(_, rule)| rule(reading, window))
        .map(|(kind, _)| Anomaly::from_reading(*kind, reading, now))
}

fn threshold_exceeded(reading: &Reading, _window: &[Reading]) -> bool {
    regulatory_limit(&reading.parameter).is_some_and(|limit| reading.value > limit)
}

fn statistical_outlier(reading: &Reading, window: &[Reading]) -> bool {
    // ---
    if window.len() < OUTLIER_MIN_WINDOW {
        return false;
    }

    // Identical values have zero spread even when the summed σ rounds above it.
    let first = window[0].value;
    if window.iter().all(|r| r.value == first) {
        return false;
    }

    let n = window.len() as f64;
    let mean = window.iter().map(|r| r.value).sum::<f64>() / n;
    let variance = window.iter().map(|r| (r.value - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    if std_dev == 0.0 || !std_dev.is_finite() {
        return false;
    }

    let z = (reading.value - mean) / std_dev;
    z.is_finite() && z.abs() > OUTLIER_Z_SCORE
}

fn spike_detected(reading: &Reading, window: &[Reading]) -> bool {
    // ---
    if window.len() < SPIKE_MIN_WINDOW {
        return false;
    }

    let mean = window.iter().map(|r| r.value).sum::<f64>() / window.len() as f64;
    mean.is_finite() && reading.value > mean * SPIKE_FACTOR
}

fn geographic_inconsistency(reading: &Reading, window: &[Reading]) -> bool {
    // ---
    let mut nearby: Vec<f64> = window
        .iter()
        .filter(|r| within_bounding_box(reading, r.latitude, r.longitude))
        .map(|r| r.value)
        .collect();

    if nearby.len() < GEO_MIN_NEARBY {
        return false;
    }

    let Some(median) = median(&mut nearby) else {
        return false;
    };

    reading.value > median * GEO_FACTOR || (median > 0.0 && reading.value * GEO_FACTOR < median)
}

/// Median with the even-count averaging rule. Sorts `values` in place.
fn median(values: &mut [f64]) -> Option<f64> {
    // ---
    if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    values.sort_by(f64::total_cmp);

    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::Duration;

    fn reading(parameter: &str, value: f64) -> Reading {
        Reading::new(41.015, 28.979, parameter, value, Utc::now())
    }

    fn window_of(parameter: &str, values: &[f64]) -> Vec<Reading> {
        // ---
        let now = Utc::now();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Reading::new(
                    41.015,
                    28.979,
                    parameter,
                    *v,
                    now - Duration::hours(i as i64 + 1),
                )
            })
            .collect()
    }

    fn kind_of(r: &Reading, window: &[Reading]) -> Option<AnomalyKind> {
        detect(r, window).map(|a| a.kind)
    }

    #[test]
    fn test_threshold_limits() {
        // ---
        let cases = [
            ("PM2.5", 10.0, false),
            ("PM2.5", 20.0, true),
            ("PM10", 40.0, false),
            ("PM10", 50.0, true),
            ("NO2", 20.0, false),
            ("NO2", 30.0, true),
            ("O3", 90.0, false),
            ("O3", 110.0, true),
            ("CO", 100.0, false),
        ];

        for (parameter, value, expected) in cases {
            let flagged = kind_of(&reading(parameter, value), &[]) == Some(AnomalyKind::ThresholdExceeded);
            assert_eq!(flagged, expected, "{parameter} at {value}");
        }
    }

    #[test]
    fn test_threshold_boundary_is_exclusive() {
        // ---
        assert_eq!(kind_of(&reading("PM2.5", 15.0), &[]), None);
        assert_eq!(
            kind_of(&reading("PM2.5", 15.0001), &[]),
            Some(AnomalyKind::ThresholdExceeded)
        );
    }

    #[test]
    fn test_statistical_outlier() {
        // ---
        // values 20, 21, 22 repeating
        let values: Vec<f64> = (0..10).map(|i| 20.0 + (i % 3) as f64).collect();
        let window = window_of("CO", &values);

        assert_eq!(kind_of(&reading("CO", 23.0), &window), None);

        // 50 is both a z-score outlier and a spike; outlier ranks first.
        assert_eq!(
            kind_of(&reading("CO", 50.0), &window),
            Some(AnomalyKind::StatisticalOutlier)
        );

        // Below the mean counts too.
        assert!(statistical_outlier(&reading("CO", 0.0), &window));
    }

    #[test]
    fn test_outlier_needs_ten_entries() {
        // ---
        let values: Vec<f64> = (0..9).map(|i| 20.0 + (i % 3) as f64).collect();
        let window = window_of("CO", &values);

        assert!(!statistical_outlier(&reading("CO", 10_000.0), &window));
    }

    #[test]
    fn test_outlier_ignores_zero_spread() {
        // ---
        let window = window_of("CO", &[5.0; 12]);

        assert!(!statistical_outlier(&reading("CO", 1.0e9), &window));
        // the spike rule still catches it
        assert_eq!(
            kind_of(&reading("CO", 1.0e9), &window),
            Some(AnomalyKind::SpikeDetected)
        );
    }

    #[test]
    fn test_outlier_ignores_identical_inexact_values() {
        // ---
        // these sum with rounding error, leaving a tiny non-zero σ
        for value in [0.1, 0.3, 0.7, 1.1, 2.3] {
            let window = window_of("CO", &[value; 10]);
            assert!(
                !statistical_outlier(&reading("CO", value * 1.2), &window),
                "identical window of {} flagged",
                value
            );
        }
    }

    #[test]
    fn test_spike_detection() {
        // ---
        let window = window_of("CO", &[10.0, 10.0, 10.0, 10.0, 10.0]);

        assert_eq!(kind_of(&reading("CO", 15.0), &window), None);
        assert_eq!(
            kind_of(&reading("CO", 15.1), &window),
            Some(AnomalyKind::SpikeDetected)
        );

        let short = window_of("CO", &[10.0, 10.0, 10.0, 10.0]);
        assert!(!spike_detected(&reading("CO", 100.0), &short));
    }

    #[test]
    fn test_geographic_median_even_count() {
        // ---
        let window = window_of("CO", &[10.0, 20.0, 30.0, 40.0]);

        assert_eq!(
            kind_of(&reading("CO", 80.0), &window),
            Some(AnomalyKind::GeographicInconsistency)
        );
        assert_eq!(kind_of(&reading("CO", 70.0), &window), None);
    }

    #[test]
    fn test_geographic_undershoot() {
        // ---
        let window = window_of("CO", &[30.0, 30.0, 30.0]);

        assert_eq!(
            kind_of(&reading("CO", 9.0), &window),
            Some(AnomalyKind::GeographicInconsistency)
        );
        assert_eq!(kind_of(&reading("CO", 10.0), &window), None);
    }

    #[test]
    fn test_geographic_zero_median_only_overshoots() {
        // ---
        let window = window_of("CO", &[0.0, 0.0, 0.0]);

        assert!(!geographic_inconsistency(&reading("CO", 0.0), &window));
        assert!(geographic_inconsistency(&reading("CO", 0.1), &window));
    }

    #[test]
    fn test_geographic_ignores_distant_readings() {
        // ---
        let mut window = window_of("CO", &[10.0, 10.0]);
        window.push(Reading::new(42.0, 28.979, "CO", 10.0, Utc::now()));
        window.push(Reading::new(41.015, 30.0, "CO", 10.0, Utc::now()));

        // only two readings fall inside the box
        assert!(!geographic_inconsistency(&reading("CO", 100.0), &window));
    }

    #[test]
    fn test_threshold_wins_over_outlier() {
        // ---
        let values: Vec<f64> = (0..10).map(|i| 5.0 + (i % 2) as f64).collect();
        let window = window_of("PM2.5", &values);
        let r = reading("PM2.5", 40.0);

        assert!(statistical_outlier(&r, &window));
        assert_eq!(kind_of(&r, &window), Some(AnomalyKind::ThresholdExceeded));
    }

    #[test]
    fn test_anomaly_copies_reading() {
        // ---
        let r = reading("NO2", 30.0);
        let now = Utc::now();
        let anomaly = detect_at(&r, &[], now).unwrap();

        assert_eq!(anomaly.parameter, "NO2");
        assert_eq!(anomaly.value, 30.0);
        assert_eq!(anomaly.latitude, r.latitude);
        assert_eq!(anomaly.longitude, r.longitude);
        assert_eq!(anomaly.detected_at, now);

        let source = anomaly.source.unwrap();
        assert_eq!(source.id, r.id);
        assert_eq!(source.timestamp, r.timestamp);
    }

    #[test]
    fn test_non_finite_window_is_no_verdict() {
        // ---
        let mut values = vec![10.0; 11];
        values[3] = f64::NAN;
        let window = window_of("CO", &values);

        assert_eq!(kind_of(&reading("CO", 12.0), &window), None);
    }
}
