//! Lobby message handlers
//!
//! Creating, joining and leaving games, and game chat.

use crate::protocol::{CreateGameRequest, ServerMessage};
use crate::state::{AppState, ChatError, LifecycleError};
use std::sync::Arc;

fn lifecycle_error(e: LifecycleError) -> Option<ServerMessage> {
    if matches!(e, LifecycleError::Store(_)) {
        tracing::error!("Lifecycle failure: {}", e);
    }
    Some(ServerMessage::error(e.code(), e.to_string()))
}

pub async fn handle_create_game(
    state: &Arc<AppState>,
    user: &str,
    request: CreateGameRequest,
) -> Option<ServerMessage> {
    tracing::info!("Create game request from {}: {}", user, request.name);
    match state.create_game(user, request).await {
        Ok(game) => Some(ServerMessage::GameCreated { game }),
        Err(e) => lifecycle_error(e),
    }
}

pub async fn handle_take_seat(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    password: Option<&str>,
) -> Option<ServerMessage> {
    tracing::info!("{} taking a seat in {}", user, game);
    match state.take_seat(user, game, password).await {
        Ok(()) => None,
        Err(e) => lifecycle_error(e),
    }
}

pub async fn handle_leave_game(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
) -> Option<ServerMessage> {
    tracing::info!("{} leaving {}", user, game);
    match state.leave_game(user, game).await {
        Ok(()) => None,
        Err(e) => lifecycle_error(e),
    }
}

pub async fn handle_read_chat(
    state: &Arc<AppState>,
    user: Option<&str>,
    game: &str,
) -> Option<ServerMessage> {
    if !state.store.exists(game).await {
        return Some(ServerMessage::error("GAME_NOT_FOUND", "Game not found"));
    }
    Some(ServerMessage::ChatHistory {
        game: game.to_string(),
        entries: state.chat_history(game, user).await,
    })
}

pub async fn handle_game_chat(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    chat: &str,
) -> Option<ServerMessage> {
    match state.add_game_chat(user, game, chat).await {
        Ok(_) => None,
        Err(ChatError::Store(e)) => {
            tracing::error!("Chat failure in {}: {}", game, e);
            Some(ServerMessage::error("STORE_ERROR", e.to_string()))
        }
        Err(e) => {
            tracing::debug!("Chat from {} in {} refused: {}", user, game, e);
            Some(ServerMessage::error(e.code(), e.to_string()))
        }
    }
}
