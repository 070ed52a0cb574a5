//! Recursive multi-step forecasting: temperature projection, the forecast
//! loop itself, prediction intervals and the derived CO₂ estimate.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::features::{calendar_encoding, FeatureRow, MAX_FEATURE_WINDOW};
use crate::model::ModelBundle;

/// Fallback when no temperature has ever been observed.
pub const DEFAULT_TEMPERATURE_C: f64 = 20.0;

/// Two-sided 95% Gaussian critical value.
const GAUSSIAN_95_Z: f64 = 1.96;

/// Length of the tiled seasonal temperature profile.
const SEASONAL_PROFILE_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastResult {
    pub building_id: String,
    pub horizon: usize,
    pub ts: Vec<DateTime<Utc>>,
    pub q_forecast: Vec<f64>,
    pub pi_low: Vec<f64>,
    pub pi_high: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CarbonResult {
    pub building_id: String,
    pub horizon: usize,
    pub factor_g_per_kwh: f64,
    pub ts: Vec<DateTime<Utc>>,
    pub co2_g: Vec<f64>,
    pub total_co2_g: f64,
}

/// "Same hour yesterday" persistence projection. When the trailing 24
/// rows all carry a temperature, that profile is cycled to exactly
/// `horizon` values; otherwise the projection is flat at the last known
/// temperature, or [`DEFAULT_TEMPERATURE_C`] if none was ever observed.
/// This is a coarse heuristic, not a weather model: it knows nothing
/// beyond 24-step periodicity and silently degrades to a constant on
/// sparse data.
pub fn project_temperatures(history: &[FeatureRow], horizon: usize) -> Vec<f64> {
    if history.len() >= SEASONAL_PROFILE_LEN {
        let tail = &history[history.len() - SEASONAL_PROFILE_LEN..];
        let profile: Vec<f64> = tail.iter().filter_map(|row| row.temperature).collect();
        if profile.len() == SEASONAL_PROFILE_LEN {
            return profile.iter().copied().cycle().take(horizon).collect();
        }
    }

    let last_known = history
        .iter()
        .rev()
        .find_map(|row| row.temperature)
        .unwrap_or(DEFAULT_TEMPERATURE_C);
    vec![last_known; horizon]
}

/// Run the recursive forecast loop over `history` (the working series).
///
/// Each step predicts one hour further out, then appends its own
/// prediction to the working series so the next step's lag and rolling
/// features are derived from synthetic values. Errors compound forward:
/// this is multi-step recursive forecasting, not a batch of independent
/// single-step predictions.
///
/// An empty history yields an empty forecast.
pub fn run_forecast(bundle: &ModelBundle, history: &[FeatureRow], horizon: usize) -> ForecastResult {
    let Some(last_row) = history.last() else {
        return ForecastResult {
            building_id: bundle.building_id.clone(),
            horizon: 0,
            ts: Vec::new(),
            q_forecast: Vec::new(),
            pi_low: Vec::new(),
            pi_high: Vec::new(),
        };
    };

    let temperatures = project_temperatures(history, horizon);
    let last_ts = last_row.ts;

    let mut series: Vec<f64> = history.iter().map(|row| row.q_flow_heat).collect();
    let mut ts = Vec::with_capacity(horizon);
    let mut q_forecast = Vec::with_capacity(horizon);

    for h in 1..=horizon {
        let target_ts = last_ts + ChronoDuration::hours(h as i64);
        let (hour, dow, hour_sin, hour_cos, dow_sin, dow_cos) = calendar_encoding(target_ts);

        let lag_1 = series[series.len() - 1];
        let lag_24 = if series.len() >= MAX_FEATURE_WINDOW {
            series[series.len() - MAX_FEATURE_WINDOW]
        } else {
            warn!(
                component = "forecast",
                event = "forecast.lag24_fallback",
                building_id = %bundle.building_id,
                step = h,
                series_len = series.len()
            );
            lag_1
        };

        let features = [
            hour,
            dow,
            hour_sin,
            hour_cos,
            dow_sin,
            dow_cos,
            temperatures[h - 1],
            lag_1,
            lag_24,
            trailing_mean(&series, 3),
            trailing_mean(&series, 6),
            trailing_mean(&series, MAX_FEATURE_WINDOW),
        ];

        let yhat = bundle.predict(&features);
        ts.push(target_ts);
        q_forecast.push(yhat);
        series.push(yhat);
    }

    let (pi_low, pi_high): (Vec<f64>, Vec<f64>) = q_forecast
        .iter()
        .map(|&point| prediction_interval(point, bundle.resid_std))
        .unzip();

    info!(
        component = "forecast",
        event = "forecast.finish",
        building_id = %bundle.building_id,
        horizon = horizon,
        history_rows = history.len()
    );

    ForecastResult {
        building_id: bundle.building_id.clone(),
        horizon,
        ts,
        q_forecast,
        pi_low,
        pi_high,
    }
}

/// Symmetric 95% band around a point forecast. The lower bound is clamped
/// at zero since the target is a non-negative physical flow; a zero
/// `resid_std` collapses the band to the point itself.
pub fn prediction_interval(point: f64, resid_std: f64) -> (f64, f64) {
    let delta = GAUSSIAN_95_Z * resid_std;
    ((point - delta).max(0.0), point + delta)
}

/// Per-step CO₂ in grams: forecast kWh times the grid factor.
pub fn carbon_from_forecast(forecast: &ForecastResult, factor_g_per_kwh: f64) -> CarbonResult {
    let co2_g: Vec<f64> = forecast
        .q_forecast
        .iter()
        .map(|q| q * factor_g_per_kwh)
        .collect();
    let total_co2_g = co2_g.iter().sum();

    CarbonResult {
        building_id: forecast.building_id.clone(),
        horizon: forecast.horizon,
        factor_g_per_kwh,
        ts: forecast.ts.clone(),
        co2_g,
        total_co2_g,
    }
}

/// Mean of the trailing `window` values, over the whole series when it is
/// shorter than the window.
fn trailing_mean(series: &[f64], window: usize) -> f64 {
    let start = series.len().saturating_sub(window);
    let slice = &series[start..];
    slice.iter().sum::<f64>() / slice.len() as f64
}
