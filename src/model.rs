//! Model fitting, evaluation and bundle persistence.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use linfa::traits::Fit;
use linfa::Dataset;
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::features::{schema_fingerprint, FeatureRow, FEATURE_NAMES};

/// Chronological split point: everything before the 90th percentile index
/// trains, the tail evaluates.
const TRAIN_SPLIT_FRACTION: f64 = 0.9;

/// Trained regressor plus everything needed to reproduce its predictions.
/// Coefficients are stored in [`FEATURE_NAMES`] order so the persisted
/// form round-trips exactly and prediction is a plain dot product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub building_id: String,
    pub feature_names: Vec<String>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    pub resid_std: f64,
    pub trained_at: DateTime<Utc>,
    pub schema_fingerprint: String,
}

impl ModelBundle {
    pub fn predict(&self, features: &[f64; 12]) -> f64 {
        let weighted: f64 = self
            .coefficients
            .iter()
            .zip(features.iter())
            .map(|(c, x)| c * x)
            .sum();
        self.intercept + weighted
    }
}

/// Lightweight record written next to the bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub building_id: String,
    pub resid_std: f64,
    pub trained_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainReport {
    pub building_id: String,
    pub mae: f64,
    pub resid_std: f64,
    pub rows: usize,
}

#[derive(Debug, Error)]
#[error("model fit failed: {0}")]
pub struct ModelFitError(String);

#[derive(Debug, Error)]
pub enum ModelStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bundle encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no trained model for building '{0}'")]
    NotFound(String),
    #[error("schema fingerprint mismatch for building '{building_id}': expected {expected}, got {actual}")]
    SchemaFingerprintMismatch {
        building_id: String,
        expected: String,
        actual: String,
    },
}

/// Fit an ordinary least squares regressor on the chronologically earlier
/// 90% of `rows` and evaluate MAE and residual std on the held-out tail.
/// `rows` must be complete feature rows in ascending time order.
pub fn fit_and_evaluate(
    building_id: &str,
    rows: &[FeatureRow],
) -> Result<(ModelBundle, TrainReport), ModelFitError> {
    let split = (rows.len() as f64 * TRAIN_SPLIT_FRACTION) as usize;
    let (train_rows, eval_rows) = rows.split_at(split);

    let (x, y) = design_matrix(train_rows)?;

    // Constant columns (a flat temperature series, say) make the least
    // squares problem rank-deficient; they carry no signal beyond the
    // intercept, so they are excluded and get a zero coefficient.
    let active = varying_columns(&x);
    let (intercept, coefficients) = if active.is_empty() {
        let mean = y.iter().sum::<f64>() / y.len().max(1) as f64;
        (mean, vec![0.0; FEATURE_NAMES.len()])
    } else {
        let reduced = x.select(Axis(1), &active);
        let dataset = Dataset::new(reduced, y);
        let fitted = LinearRegression::default()
            .fit(&dataset)
            .map_err(|e| ModelFitError(e.to_string()))?;

        let mut coefficients = vec![0.0; FEATURE_NAMES.len()];
        for (slot, value) in active.iter().zip(fitted.params().iter()) {
            coefficients[*slot] = *value;
        }
        (fitted.intercept(), coefficients)
    };

    let mut residuals = Vec::with_capacity(eval_rows.len());
    for row in eval_rows {
        let features = row
            .feature_vector()
            .ok_or_else(|| ModelFitError("incomplete row in evaluation tail".to_string()))?;
        let weighted: f64 = coefficients
            .iter()
            .zip(features.iter())
            .map(|(c, v)| c * v)
            .sum();
        residuals.push(row.q_flow_heat - (intercept + weighted));
    }

    let mae = if residuals.is_empty() {
        0.0
    } else {
        residuals.iter().map(|r| r.abs()).sum::<f64>() / residuals.len() as f64
    };
    let resid_std = population_std(&residuals);

    let bundle = ModelBundle {
        building_id: building_id.to_string(),
        feature_names: FEATURE_NAMES.iter().map(|n| n.to_string()).collect(),
        intercept,
        coefficients,
        resid_std,
        trained_at: Utc::now(),
        schema_fingerprint: schema_fingerprint(),
    };
    let report = TrainReport {
        building_id: building_id.to_string(),
        mae,
        resid_std,
        rows: rows.len(),
    };

    info!(
        component = "trainer",
        event = "train.fit",
        building_id = building_id,
        train_rows = train_rows.len(),
        eval_rows = eval_rows.len(),
        mae = mae,
        resid_std = resid_std
    );

    Ok((bundle, report))
}

/// Indices of columns with non-zero variance.
fn varying_columns(x: &Array2<f64>) -> Vec<usize> {
    let mut active = Vec::new();
    for (idx, column) in x.columns().into_iter().enumerate() {
        let n = column.len();
        if n == 0 {
            continue;
        }
        let mean = column.sum() / n as f64;
        let variance = column.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
        if variance > 1e-12 {
            active.push(idx);
        }
    }
    active
}

fn design_matrix(rows: &[FeatureRow]) -> Result<(Array2<f64>, Array1<f64>), ModelFitError> {
    let mut flat = Vec::with_capacity(rows.len() * FEATURE_NAMES.len());
    let mut targets = Vec::with_capacity(rows.len());
    for row in rows {
        let features = row
            .feature_vector()
            .ok_or_else(|| ModelFitError("incomplete row in training partition".to_string()))?;
        flat.extend_from_slice(&features);
        targets.push(row.q_flow_heat);
    }

    let x = Array2::from_shape_vec((rows.len(), FEATURE_NAMES.len()), flat)
        .map_err(|e| ModelFitError(e.to_string()))?;
    Ok((x, Array1::from_vec(targets)))
}

fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    variance.sqrt()
}

/// Keyed blob store for model bundles, one bundle plus one meta file per
/// building. Writes take a per-building lock and replace atomically, so
/// concurrent readers see the old or the new bundle, never a partial one.
pub struct ModelStore {
    models_dir: PathBuf,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ModelStore {
    pub fn open(models_dir: impl Into<PathBuf>) -> Result<Self, ModelStoreError> {
        let models_dir = models_dir.into();
        fs::create_dir_all(&models_dir)?;
        Ok(Self {
            models_dir,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    fn bundle_path(&self, building_id: &str) -> PathBuf {
        self.models_dir.join(format!("{building_id}.model.json"))
    }

    fn meta_path(&self, building_id: &str) -> PathBuf {
        self.models_dir.join(format!("{building_id}.meta.json"))
    }

    fn write_lock(&self, building_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .expect("model store lock map should not be poisoned");
        locks
            .entry(building_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Persist a bundle, unconditionally overwriting any prior one.
    pub fn save(&self, bundle: &ModelBundle) -> Result<(), ModelStoreError> {
        let lock = self.write_lock(&bundle.building_id);
        let _guard = lock
            .lock()
            .expect("per-building write lock should not be poisoned");

        let meta = ModelMeta {
            building_id: bundle.building_id.clone(),
            resid_std: bundle.resid_std,
            trained_at: bundle.trained_at,
        };

        write_atomic(
            &self.bundle_path(&bundle.building_id),
            &serde_json::to_vec_pretty(bundle)?,
        )?;
        write_atomic(
            &self.meta_path(&bundle.building_id),
            &serde_json::to_vec_pretty(&meta)?,
        )?;

        info!(
            component = "model_store",
            event = "model.saved",
            building_id = %bundle.building_id,
            resid_std = bundle.resid_std
        );

        Ok(())
    }

    pub fn load(&self, building_id: &str) -> Result<ModelBundle, ModelStoreError> {
        let path = self.bundle_path(building_id);
        if !path.exists() {
            return Err(ModelStoreError::NotFound(building_id.to_string()));
        }

        let bytes = fs::read(&path)?;
        let bundle: ModelBundle = serde_json::from_slice(&bytes)?;

        let expected = schema_fingerprint();
        if bundle.schema_fingerprint != expected {
            return Err(ModelStoreError::SchemaFingerprintMismatch {
                building_id: building_id.to_string(),
                expected,
                actual: bundle.schema_fingerprint,
            });
        }

        Ok(bundle)
    }

    pub fn load_meta(&self, building_id: &str) -> Result<ModelMeta, ModelStoreError> {
        let path = self.meta_path(building_id);
        if !path.exists() {
            return Err(ModelStoreError::NotFound(building_id.to_string()));
        }
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "bundle".to_string());
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bundle(building_id: &str) -> ModelBundle {
        ModelBundle {
            building_id: building_id.to_string(),
            feature_names: FEATURE_NAMES.iter().map(|n| n.to_string()).collect(),
            intercept: 1.25,
            coefficients: (0..12).map(|i| i as f64 * 0.5).collect(),
            resid_std: 0.75,
            trained_at: Utc::now(),
            schema_fingerprint: schema_fingerprint(),
        }
    }

    #[test]
    fn bundle_round_trips_exactly_through_the_store() {
        let dir = tempdir().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();

        let original = bundle("b1");
        store.save(&original).unwrap();
        let loaded = store.load("b1").unwrap();
        assert_eq!(loaded, original);

        let meta = store.load_meta("b1").unwrap();
        assert_eq!(meta.resid_std, original.resid_std);
        assert_eq!(meta.trained_at, original.trained_at);
    }

    #[test]
    fn load_without_training_reports_not_found() {
        let dir = tempdir().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        let err = store.load("missing").unwrap_err();
        assert!(matches!(err, ModelStoreError::NotFound(id) if id == "missing"));
    }

    #[test]
    fn retrain_overwrites_the_previous_bundle() {
        let dir = tempdir().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();

        store.save(&bundle("b1")).unwrap();
        let mut second = bundle("b1");
        second.intercept = 9.0;
        store.save(&second).unwrap();

        assert_eq!(store.load("b1").unwrap().intercept, 9.0);
    }

    #[test]
    fn load_rejects_a_foreign_schema_fingerprint() {
        let dir = tempdir().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();

        let mut stale = bundle("b1");
        stale.schema_fingerprint = "deadbeef".to_string();
        // Bypass save() to simulate a bundle written by an older build.
        fs::write(
            dir.path().join("b1.model.json"),
            serde_json::to_vec(&stale).unwrap(),
        )
        .unwrap();

        let err = store.load("b1").unwrap_err();
        assert!(matches!(
            err,
            ModelStoreError::SchemaFingerprintMismatch { .. }
        ));
    }

    #[test]
    fn predict_is_intercept_plus_dot_product() {
        let b = bundle("b1");
        let features = [1.0; 12];
        let expected = 1.25 + (0..12).map(|i| i as f64 * 0.5).sum::<f64>();
        assert!((b.predict(&features) - expected).abs() < 1e-12);
    }

    #[test]
    fn zero_residuals_give_zero_std_and_mae() {
        assert_eq!(population_std(&[]), 0.0);
        assert_eq!(population_std(&[2.0, 2.0, 2.0]), 0.0);
    }

    #[test]
    fn fit_recovers_an_exact_linear_relation_and_zeroes_constant_columns() {
        use crate::features::FeatureRow;
        use chrono::TimeZone;

        let rows: Vec<FeatureRow> = (0..60)
            .map(|i| {
                let t = i as f64;
                let lag_1 = t;
                let roll_6 = (t * 0.29).sin();
                FeatureRow {
                    ts: Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap()
                        + chrono::Duration::hours(i),
                    q_flow_heat: 3.0 + 2.0 * lag_1 - 1.5 * roll_6,
                    hour: (i % 24) as f64,
                    dow: ((i / 24) % 7) as f64,
                    hour_sin: (t * 0.26).sin(),
                    hour_cos: (t * 0.26).cos(),
                    dow_sin: (t * 0.037).sin(),
                    dow_cos: (t * 0.041).cos(),
                    temperature: Some(20.0),
                    lag_1: Some(lag_1),
                    lag_24: Some((t * 0.37).sin()),
                    roll_3: Some((t * 0.53).cos()),
                    roll_6: Some(roll_6),
                    roll_24: Some((t * 0.17).sin()),
                }
            })
            .collect();

        let (bundle, report) = fit_and_evaluate("b1", &rows).unwrap();

        assert_eq!(report.rows, 60);
        assert!(report.mae < 1e-6, "mae = {}", report.mae);
        assert!(report.resid_std < 1e-6);

        let temperature_idx = FEATURE_NAMES
            .iter()
            .position(|n| *n == "temperature")
            .unwrap();
        assert_eq!(bundle.coefficients[temperature_idx], 0.0);
        assert_eq!(bundle.coefficients.len(), 12);
    }
}
