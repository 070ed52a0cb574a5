//! Engine facade: the single core implementation of ingest, train,
//! forecast and carbon, plus the history/health read surface. Both the
//! open and the secured HTTP entry points call into this type.

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::features::{build_feature_rows, complete_rows};
use crate::forecast::{carbon_from_forecast, run_forecast, CarbonResult, ForecastResult};
use crate::model::{fit_and_evaluate, ModelFitError, ModelStore, ModelStoreError, TrainReport};
use crate::store::{Measurement, MeasurementStore, StoreError};

/// Minimum raw measurement rows required to train.
pub const DEFAULT_MIN_TRAINING_ROWS: usize = 72;

/// Minimum historical rows required to forecast.
pub const MIN_FORECAST_HISTORY_ROWS: usize = 48;

/// Grid carbon intensity default, grams CO₂ per kWh.
pub const DEFAULT_CARBON_FACTOR_G_PER_KWH: f64 = 220.0;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no records provided")]
    NoRecords,
    #[error("not enough data: need at least {required} hourly rows, have {actual}")]
    InsufficientData { required: usize, actual: usize },
    #[error("no usable rows after feature engineering")]
    NoUsableRows,
    #[error("no trained model for building '{0}'; train first")]
    ModelNotFound(String),
    #[error("no measurements for building '{0}'")]
    NoMeasurements(String),
    #[error("measurement store failure: {0}")]
    Store(#[from] StoreError),
    #[error("model store failure: {0}")]
    ModelStore(ModelStoreError),
    #[error("model fit failure: {0}")]
    Fit(#[from] ModelFitError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub rows: u64,
}

pub struct Engine {
    store: MeasurementStore,
    models: ModelStore,
}

impl Engine {
    pub fn new(store: MeasurementStore, models: ModelStore) -> Self {
        Self { store, models }
    }

    /// Idempotent batch ingest; re-sending an identical batch leaves the
    /// store's observable state unchanged.
    pub fn ingest(&self, building_id: &str, records: &[Measurement]) -> Result<usize, EngineError> {
        if records.is_empty() {
            return Err(EngineError::NoRecords);
        }
        Ok(self.store.upsert_batch(building_id, records)?)
    }

    /// Train and persist a model for one building. The chronological 90/10
    /// split and the evaluation metrics live in [`fit_and_evaluate`]; this
    /// method enforces the row thresholds and owns the bundle write.
    pub fn train(&self, building_id: &str, min_rows: usize) -> Result<TrainReport, EngineError> {
        let measurements = self.store.query_ordered(building_id)?;
        if measurements.len() < min_rows {
            return Err(EngineError::InsufficientData {
                required: min_rows,
                actual: measurements.len(),
            });
        }

        let usable = complete_rows(&build_feature_rows(&measurements));
        if usable.is_empty() {
            return Err(EngineError::NoUsableRows);
        }

        let (bundle, report) = fit_and_evaluate(building_id, &usable)?;
        self.models.save(&bundle).map_err(EngineError::ModelStore)?;

        info!(
            component = "trainer",
            event = "train.finish",
            building_id = building_id,
            rows = report.rows,
            mae = report.mae,
            resid_std = report.resid_std
        );

        Ok(report)
    }

    /// Recursive multi-step forecast with 95% bounds.
    pub fn forecast(&self, building_id: &str, horizon: usize) -> Result<ForecastResult, EngineError> {
        let bundle = match self.models.load(building_id) {
            Ok(bundle) => bundle,
            Err(ModelStoreError::NotFound(id)) => return Err(EngineError::ModelNotFound(id)),
            Err(e) => return Err(EngineError::ModelStore(e)),
        };

        let measurements = self.store.query_ordered(building_id)?;
        if measurements.len() < MIN_FORECAST_HISTORY_ROWS {
            return Err(EngineError::InsufficientData {
                required: MIN_FORECAST_HISTORY_ROWS,
                actual: measurements.len(),
            });
        }

        let history = build_feature_rows(&measurements);
        Ok(run_forecast(&bundle, &history, horizon))
    }

    /// CO₂ estimate derived from the forecast.
    pub fn carbon(
        &self,
        building_id: &str,
        horizon: usize,
        factor_g_per_kwh: f64,
    ) -> Result<CarbonResult, EngineError> {
        let forecast = self.forecast(building_id, horizon)?;
        Ok(carbon_from_forecast(&forecast, factor_g_per_kwh))
    }

    /// Trailing `hours` measurements, ascending.
    pub fn history(&self, building_id: &str, hours: usize) -> Result<Vec<Measurement>, EngineError> {
        let measurements = self.store.query_ordered(building_id)?;
        if measurements.is_empty() {
            return Err(EngineError::NoMeasurements(building_id.to_string()));
        }
        let start = measurements.len().saturating_sub(hours);
        Ok(measurements[start..].to_vec())
    }

    pub fn health(&self) -> Result<Health, EngineError> {
        Ok(Health {
            status: "ok",
            rows: self.store.total_rows()?,
        })
    }
}
