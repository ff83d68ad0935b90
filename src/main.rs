use std::path::Path;
use std::sync::Arc;

use ambulance_dispatch::api;
use ambulance_dispatch::config::Config;
use ambulance_dispatch::error::AppError;
use ambulance_dispatch::state::AppState;
use ambulance_dispatch::store::memory::MemoryStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let store = Arc::new(MemoryStore::new(config.event_buffer_size));
    if let Some(seed_file) = &config.seed_file {
        store.load_seed_file(Path::new(seed_file)).await?;
    }

    let http_port = config.http_port;
    let shared_state = Arc::new(AppState::new(config, store));
    let app = api::rest::router(shared_state);

    let bind_addr = format!("0.0.0.0:{http_port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
