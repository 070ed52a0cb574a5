use std::{net::SocketAddr, sync::Arc};

use heatcast::{
    api_router, init_logging, log_app_bind, log_app_start, log_router_mode,
    logging_config_from_env, secured_api_router, Engine, MeasurementStore, ModelStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let db_path =
        std::env::var("HEATCAST_DB_PATH").unwrap_or_else(|_| "data/heatcast.db".to_string());
    let models_dir = std::env::var("HEATCAST_MODELS_DIR").unwrap_or_else(|_| "models".to_string());
    let addr: SocketAddr = std::env::var("HEATCAST_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let store = MeasurementStore::open(&db_path)?;
    let models = ModelStore::open(&models_dir)?;
    let engine = Arc::new(Engine::new(store, models));

    let app = match std::env::var("HEATCAST_API_TOKEN") {
        Ok(token) if !token.trim().is_empty() => {
            log_router_mode(true);
            secured_api_router(engine, token.trim())
        }
        _ => {
            log_router_mode(false);
            api_router(engine)
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
