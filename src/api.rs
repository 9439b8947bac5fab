//! HTTP API endpoints for the lobby.
//!
//! Both read without taking game locks.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;

use crate::protocol::GameSummary;
use crate::state::AppState;

/// List active games.
///
/// GET /api/games
pub async fn list_games(State(state): State<Arc<AppState>>) -> Json<Vec<GameSummary>> {
    Json(state.game_summaries().await)
}

/// Public snapshot of one game.
///
/// GET /api/games/{key}
pub async fn get_game(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.snapshot(&key).await {
        Some(game) => Json(game).into_response(),
        None => (StatusCode::NOT_FOUND, format!("Game {} not found", key)).into_response(),
    }
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/games", get(list_games))
        .route("/api/games/{key}", get(get_game))
}
