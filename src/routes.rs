use crate::{state::AppState, websocket::handlers::ws_handler, websocket::manager::RoomSnapshot};
use axum::{extract::State, routing::get, Json, Router};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/rooms/stats", get(room_stats))
        .route("/ws/{room_id}", get(ws_handler))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "bus_connected": state.manager.bus().is_connected().await,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn room_stats(State(state): State<AppState>) -> Json<RoomSnapshot> {
    Json(state.manager.snapshot().await)
}
