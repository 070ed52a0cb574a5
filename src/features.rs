//! Measurement-sequence to supervised feature-row transform.
//!
//! Lag and rolling features are computed by row position under an assumed
//! constant one-hour cadence: duplicate timestamps are collapsed, but data
//! gaps are not re-gridded, so `lag_24` means "24 rows back".

use std::f64::consts::PI;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::store::Measurement;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Model input columns, in the exact order fed to the regressor.
pub const FEATURE_NAMES: [&str; 12] = [
    "hour", "dow", "hour_sin", "hour_cos", "dow_sin", "dow_cos", "temperature", "lag_1", "lag_24",
    "roll_3", "roll_6", "roll_24",
];

/// Widest trailing window; the first `MAX_FEATURE_WINDOW` rows of any
/// history are always incomplete.
pub const MAX_FEATURE_WINDOW: usize = 24;

/// One engineered row. Lag/rolling features and temperature are `None`
/// when the trailing window reaches before the start of history or no
/// temperature was ever observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub ts: DateTime<Utc>,
    /// Target column, carried through untouched.
    pub q_flow_heat: f64,
    pub hour: f64,
    pub dow: f64,
    pub hour_sin: f64,
    pub hour_cos: f64,
    pub dow_sin: f64,
    pub dow_cos: f64,
    pub temperature: Option<f64>,
    pub lag_1: Option<f64>,
    pub lag_24: Option<f64>,
    pub roll_3: Option<f64>,
    pub roll_6: Option<f64>,
    pub roll_24: Option<f64>,
}

impl FeatureRow {
    /// The 12 feature values in [`FEATURE_NAMES`] order, or `None` if any
    /// is unset.
    pub fn feature_vector(&self) -> Option<[f64; 12]> {
        Some([
            self.hour,
            self.dow,
            self.hour_sin,
            self.hour_cos,
            self.dow_sin,
            self.dow_cos,
            self.temperature?,
            self.lag_1?,
            self.lag_24?,
            self.roll_3?,
            self.roll_6?,
            self.roll_24?,
        ])
    }

    pub fn is_complete(&self) -> bool {
        self.feature_vector().is_some()
    }
}

/// Calendar position of a timestamp as
/// `(hour, dow, hour_sin, hour_cos, dow_sin, dow_cos)`.
pub fn calendar_encoding(ts: DateTime<Utc>) -> (f64, f64, f64, f64, f64, f64) {
    let hour = ts.hour() as f64;
    let dow = ts.weekday().num_days_from_monday() as f64;
    let hour_angle = 2.0 * PI * hour / 24.0;
    let dow_angle = 2.0 * PI * dow / 7.0;
    (
        hour,
        dow,
        hour_angle.sin(),
        hour_angle.cos(),
        dow_angle.sin(),
        dow_angle.cos(),
    )
}

/// Pure transform of a measurement sequence into feature rows, one per
/// surviving timestamp in ascending order. Duplicate timestamps keep
/// their first occurrence; temperature is forward-filled then
/// backward-filled.
pub fn build_feature_rows(measurements: &[Measurement]) -> Vec<FeatureRow> {
    let mut ordered: Vec<&Measurement> = measurements.iter().collect();
    ordered.sort_by_key(|m| m.ts);
    ordered.dedup_by_key(|m| m.ts);

    let mut temperatures: Vec<Option<f64>> = ordered.iter().map(|m| m.temperature).collect();
    fill_forward_backward(&mut temperatures);

    let targets: Vec<f64> = ordered.iter().map(|m| m.q_flow_heat).collect();

    let rows: Vec<FeatureRow> = ordered
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let (hour, dow, hour_sin, hour_cos, dow_sin, dow_cos) = calendar_encoding(m.ts);
            FeatureRow {
                ts: m.ts,
                q_flow_heat: m.q_flow_heat,
                hour,
                dow,
                hour_sin,
                hour_cos,
                dow_sin,
                dow_cos,
                temperature: temperatures[i],
                lag_1: lag(&targets, i, 1),
                lag_24: lag(&targets, i, MAX_FEATURE_WINDOW),
                roll_3: trailing_mean(&targets, i, 3),
                roll_6: trailing_mean(&targets, i, 6),
                roll_24: trailing_mean(&targets, i, MAX_FEATURE_WINDOW),
            }
        })
        .collect();

    debug!(
        component = "features",
        event = "features.transform",
        input_rows = measurements.len(),
        output_rows = rows.len(),
        collapsed_duplicates = measurements.len() - rows.len()
    );

    rows
}

/// Rows whose every lag/rolling window lies fully inside history.
pub fn complete_rows(rows: &[FeatureRow]) -> Vec<FeatureRow> {
    rows.iter().filter(|r| r.is_complete()).cloned().collect()
}

/// Target value `steps` positions back, strictly before row `i`.
fn lag(targets: &[f64], i: usize, steps: usize) -> Option<f64> {
    if i >= steps {
        Some(targets[i - steps])
    } else {
        None
    }
}

/// Mean of the `window` values immediately before row `i`, excluding the
/// row itself.
fn trailing_mean(targets: &[f64], i: usize, window: usize) -> Option<f64> {
    if i >= window {
        let slice = &targets[i - window..i];
        Some(slice.iter().sum::<f64>() / window as f64)
    } else {
        None
    }
}

fn fill_forward_backward(values: &mut [Option<f64>]) {
    let mut last = None;
    for value in values.iter_mut() {
        match *value {
            Some(v) => last = Some(v),
            None => *value = last,
        }
    }

    let mut next = None;
    for value in values.iter_mut().rev() {
        match *value {
            Some(v) => next = Some(v),
            None => *value = next,
        }
    }
}

/// Deterministic fingerprint of the feature schema; persisted in model
/// bundles and checked before a bundle is used for prediction.
pub fn schema_fingerprint() -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};columns:"));
    for name in FEATURE_NAMES {
        hasher.update(name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap() + chrono::Duration::hours(i)
    }

    fn series(n: usize) -> Vec<Measurement> {
        (0..n)
            .map(|i| Measurement {
                ts: hour(i as i64),
                q_flow_heat: i as f64,
                temperature: Some(10.0 + i as f64 * 0.1),
            })
            .collect()
    }

    #[test]
    fn first_24_rows_are_incomplete_and_the_25th_is_complete() {
        let rows = build_feature_rows(&series(30));
        for row in &rows[..24] {
            assert!(!row.is_complete());
        }
        assert!(rows[24].is_complete());
        assert_eq!(complete_rows(&rows).len(), 6);
    }

    #[test]
    fn lag_and_rolling_values_exclude_the_current_row() {
        let rows = build_feature_rows(&series(30));
        let row = &rows[25];
        assert_eq!(row.lag_1, Some(24.0));
        assert_eq!(row.lag_24, Some(1.0));
        // mean of rows 22..=24
        assert_eq!(row.roll_3, Some(23.0));
        // mean of rows 19..=24
        assert_eq!(row.roll_6, Some(21.5));
        // mean of rows 1..=24
        assert_eq!(row.roll_24, Some(12.5));
    }

    #[test]
    fn duplicate_timestamps_keep_the_first_occurrence() {
        let mut measurements = series(5);
        measurements.push(Measurement {
            ts: hour(2),
            q_flow_heat: 99.0,
            temperature: None,
        });

        let rows = build_feature_rows(&measurements);
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[2].q_flow_heat, 2.0);
    }

    #[test]
    fn temperature_gaps_fill_forward_then_backward() {
        let mut measurements = series(4);
        measurements[0].temperature = None;
        measurements[1].temperature = Some(7.0);
        measurements[2].temperature = None;
        measurements[3].temperature = None;

        let rows = build_feature_rows(&measurements);
        let temps: Vec<Option<f64>> = rows.iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![Some(7.0), Some(7.0), Some(7.0), Some(7.0)]);
    }

    #[test]
    fn entirely_absent_temperature_stays_unset() {
        let mut measurements = series(30);
        for m in &mut measurements {
            m.temperature = None;
        }

        let rows = build_feature_rows(&measurements);
        assert!(rows.iter().all(|r| r.temperature.is_none()));
        assert!(complete_rows(&rows).is_empty());
    }

    #[test]
    fn transform_is_pure_and_deterministic() {
        let measurements = series(48);
        let a = build_feature_rows(&measurements);
        let b = build_feature_rows(&measurements);
        assert_eq!(a, b);
    }

    #[test]
    fn calendar_encoding_matches_expected_math() {
        // 2025-01-06 is a Monday.
        let (h, d, hs, hc, ds, dc) = calendar_encoding(hour(15));
        assert_eq!(h, 15.0);
        assert_eq!(d, 0.0);
        assert!((hs - (2.0 * PI * 15.0 / 24.0).sin()).abs() < 1e-12);
        assert!((hc - (2.0 * PI * 15.0 / 24.0).cos()).abs() < 1e-12);
        assert!(ds.abs() < 1e-12);
        assert!((dc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn schema_fingerprint_is_stable() {
        assert_eq!(schema_fingerprint(), schema_fingerprint());
        assert_eq!(schema_fingerprint().len(), 64);
    }
}
