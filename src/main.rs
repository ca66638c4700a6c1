use room_broadcast_service::{
    bus::BusClient, config::Config, error::AppError, logging, routes, state::AppState,
    websocket::manager::ConnectionManager,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let config = Arc::new(Config::from_env()?);

    let bus = Arc::new(BusClient::new(&config.redis_url));
    // Best-effort: a failed connect leaves the process in local-only mode.
    bus.initialize().await;
    let manager = ConnectionManager::new(bus);

    let state = AppState {
        manager: Arc::clone(&manager),
        config: Arc::clone(&config),
    };
    let app = routes::router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| AppError::StartServer(e.to_string()))?;
    tracing::info!(%bind_addr, "starting room-broadcast-service");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::StartServer(e.to_string()))?;

    // Listener task first, then the bus connections.
    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
