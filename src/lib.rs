//! Heatcast core crate.
//!
//! Per-building hourly energy forecasting:
//! - measurement ingestion into a SQLite store
//! - feature engineering (calendar encodings, lags, rolling means)
//! - linear-model training with residual-based uncertainty
//! - recursive multi-step forecasting and a derived CO₂ estimate

mod api;
mod features;
mod forecast;
mod model;
mod observability;
mod service;
mod store;

pub use api::{api_router, secured_api_router};
pub use features::{
    build_feature_rows, calendar_encoding, complete_rows, schema_fingerprint, FeatureRow,
    FEATURE_NAMES, FEATURE_SCHEMA_VERSION, MAX_FEATURE_WINDOW,
};
pub use forecast::{
    carbon_from_forecast, prediction_interval, project_temperatures, run_forecast, CarbonResult,
    ForecastResult, DEFAULT_TEMPERATURE_C,
};
pub use model::{
    fit_and_evaluate, ModelBundle, ModelFitError, ModelMeta, ModelStore, ModelStoreError,
    TrainReport,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_router_mode, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use service::{
    Engine, EngineError, Health, DEFAULT_CARBON_FACTOR_G_PER_KWH, DEFAULT_MIN_TRAINING_ROWS,
    MIN_FORECAST_HISTORY_ROWS,
};
pub use store::{Measurement, MeasurementStore, StoreError};
