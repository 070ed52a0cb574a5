//! HTTP surface over the [`Engine`].
//!
//! There is one set of routes; [`secured_api_router`] wraps the same
//! router with a bearer-token middleware instead of duplicating the
//! pipeline behind an authenticated copy.

use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::forecast::{CarbonResult, ForecastResult};
use crate::model::TrainReport;
use crate::service::{
    Engine, EngineError, Health, DEFAULT_CARBON_FACTOR_G_PER_KWH, DEFAULT_MIN_TRAINING_ROWS,
};
use crate::store::Measurement;

const MAX_FORECAST_HOURS: usize = 168;
const MAX_HISTORY_HOURS: usize = 720;
const MIN_TRAIN_MIN_ROWS: usize = 24;

#[derive(Clone)]
struct ApiState {
    engine: Arc<Engine>,
}

pub fn api_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/history", get(get_history))
        .route("/ingest", post(post_ingest))
        .route("/train", post(post_train))
        .route("/forecast", get(get_forecast))
        .route("/carbon", get(get_carbon))
        .with_state(ApiState { engine })
}

/// The same routes behind a bearer-token check.
pub fn secured_api_router(engine: Arc<Engine>, api_token: &str) -> Router {
    let token: Arc<str> = Arc::from(api_token);
    api_router(engine).layer(middleware::from_fn(move |req: Request, next: Next| {
        let token = Arc::clone(&token);
        async move { require_bearer_token(&token, req, next).await }
    }))
}

async fn require_bearer_token(token: &str, req: Request, next: Next) -> Response {
    let authorized = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|candidate| candidate == token)
        .unwrap_or(false);

    if authorized {
        next.run(req).await
    } else {
        warn!(
            component = "api",
            event = "api.unauthorized",
            path = %req.uri().path()
        );
        ApiError::Unauthorized.into_response()
    }
}

#[derive(Debug)]
enum ApiError {
    Engine(EngineError),
    InvalidParam(&'static str),
    Unauthorized,
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::InvalidParam(message) => (StatusCode::BAD_REQUEST, (*message).to_string()),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "invalid or missing bearer token".to_string(),
            ),
            Self::Engine(err) => match err {
                EngineError::NoRecords
                | EngineError::InsufficientData { .. }
                | EngineError::NoUsableRows => (StatusCode::BAD_REQUEST, err.to_string()),
                EngineError::ModelNotFound(_) | EngineError::NoMeasurements(_) => {
                    (StatusCode::NOT_FOUND, err.to_string())
                }
                EngineError::Store(_) | EngineError::ModelStore(_) | EngineError::Fit(_) => {
                    error!(
                        component = "api",
                        event = "api.internal_error",
                        error = %err
                    );
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal failure".to_string(),
                    )
                }
            },
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct IngestPayload {
    building_id: String,
    records: Vec<Measurement>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    building_id: String,
    inserted: usize,
}

#[derive(Debug, Deserialize)]
struct TrainParams {
    building_id: String,
    #[serde(default = "default_min_rows")]
    min_rows: usize,
}

#[derive(Debug, Deserialize)]
struct ForecastParams {
    building_id: String,
    #[serde(default = "default_forecast_hours")]
    hours: usize,
}

#[derive(Debug, Deserialize)]
struct CarbonParams {
    building_id: String,
    #[serde(default = "default_forecast_hours")]
    hours: usize,
    #[serde(default = "default_carbon_factor")]
    factor_g_per_kwh: f64,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    building_id: String,
    #[serde(default = "default_history_hours")]
    hours: usize,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    rows: u64,
    app: &'static str,
    version: &'static str,
}

fn default_min_rows() -> usize {
    DEFAULT_MIN_TRAINING_ROWS
}

fn default_forecast_hours() -> usize {
    24
}

fn default_history_hours() -> usize {
    48
}

fn default_carbon_factor() -> f64 {
    DEFAULT_CARBON_FACTOR_G_PER_KWH
}

async fn get_health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, ApiError> {
    let Health { status, rows } = state.engine.health()?;
    Ok(Json(HealthResponse {
        status,
        rows,
        app: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    }))
}

async fn get_history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Measurement>>, ApiError> {
    if params.hours == 0 || params.hours > MAX_HISTORY_HOURS {
        return Err(ApiError::InvalidParam("hours must be between 1 and 720"));
    }
    Ok(Json(
        state.engine.history(&params.building_id, params.hours)?,
    ))
}

async fn post_ingest(
    State(state): State<ApiState>,
    Json(payload): Json<IngestPayload>,
) -> Result<Json<IngestResponse>, ApiError> {
    let inserted = state.engine.ingest(&payload.building_id, &payload.records)?;
    Ok(Json(IngestResponse {
        building_id: payload.building_id,
        inserted,
    }))
}

async fn post_train(
    State(state): State<ApiState>,
    Query(params): Query<TrainParams>,
) -> Result<Json<TrainReport>, ApiError> {
    if params.min_rows < MIN_TRAIN_MIN_ROWS {
        return Err(ApiError::InvalidParam("min_rows must be at least 24"));
    }
    Ok(Json(state.engine.train(&params.building_id, params.min_rows)?))
}

async fn get_forecast(
    State(state): State<ApiState>,
    Query(params): Query<ForecastParams>,
) -> Result<Json<ForecastResult>, ApiError> {
    if params.hours == 0 || params.hours > MAX_FORECAST_HOURS {
        return Err(ApiError::InvalidParam("hours must be between 1 and 168"));
    }
    Ok(Json(
        state.engine.forecast(&params.building_id, params.hours)?,
    ))
}

async fn get_carbon(
    State(state): State<ApiState>,
    Query(params): Query<CarbonParams>,
) -> Result<Json<CarbonResult>, ApiError> {
    if params.hours == 0 || params.hours > MAX_FORECAST_HOURS {
        return Err(ApiError::InvalidParam("hours must be between 1 and 168"));
    }
    Ok(Json(state.engine.carbon(
        &params.building_id,
        params.hours,
        params.factor_g_per_kwh,
    )?))
}
