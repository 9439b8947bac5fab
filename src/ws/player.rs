//! Round action handlers
//!
//! Accepted and ignored actions produce no direct reply; the game update is
//! broadcast to everyone watching. Rejected actions alert the actor.

use crate::protocol::ServerMessage;
use crate::state::{ActionOrigin, ActionOutcome, AppState};
use std::sync::Arc;

fn reply(game: &str, outcome: ActionOutcome) -> Option<ServerMessage> {
    match outcome {
        ActionOutcome::Applied | ActionOutcome::Ignored => None,
        ActionOutcome::Rejected { notice } => Some(ServerMessage::Alert {
            game: game.to_string(),
            msg: notice,
        }),
    }
}

pub async fn handle_select_chancellor(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    index: usize,
) -> Option<ServerMessage> {
    tracing::debug!("{} nominates seat {} in {}", user, index, game);
    let outcome = state
        .select_chancellor(game, ActionOrigin::player(user), index)
        .await;
    reply(game, outcome)
}

pub async fn handle_vote(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    vote: bool,
) -> Option<ServerMessage> {
    let outcome = state.cast_vote(game, ActionOrigin::player(user), vote).await;
    reply(game, outcome)
}

pub async fn handle_president_select_policy(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    index: usize,
) -> Option<ServerMessage> {
    let outcome = state
        .president_select_policy(game, ActionOrigin::player(user), index)
        .await;
    reply(game, outcome)
}

pub async fn handle_chancellor_select_policy(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    index: usize,
) -> Option<ServerMessage> {
    let outcome = state
        .chancellor_select_policy(game, ActionOrigin::player(user), index)
        .await;
    reply(game, outcome)
}

pub async fn handle_chancellor_veto_vote(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    veto: bool,
) -> Option<ServerMessage> {
    let outcome = state
        .chancellor_veto_vote(game, ActionOrigin::player(user), veto)
        .await;
    reply(game, outcome)
}

pub async fn handle_president_veto_vote(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    veto: bool,
) -> Option<ServerMessage> {
    let outcome = state
        .president_veto_vote(game, ActionOrigin::player(user), veto)
        .await;
    reply(game, outcome)
}

pub async fn handle_investigate(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    index: usize,
) -> Option<ServerMessage> {
    let outcome = state
        .investigate(game, ActionOrigin::player(user), index)
        .await;
    reply(game, outcome)
}

pub async fn handle_confirm_policy_peek(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
) -> Option<ServerMessage> {
    let outcome = state
        .confirm_policy_peek(game, ActionOrigin::player(user))
        .await;
    reply(game, outcome)
}

pub async fn handle_special_election(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    index: usize,
) -> Option<ServerMessage> {
    let outcome = state
        .special_election(game, ActionOrigin::player(user), index)
        .await;
    reply(game, outcome)
}

pub async fn handle_execute(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    index: usize,
) -> Option<ServerMessage> {
    tracing::info!("{} executes seat {} in {}", user, index, game);
    let outcome = state.execute(game, ActionOrigin::player(user), index).await;
    reply(game, outcome)
}

pub async fn handle_reveal_loyalty(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    index: usize,
) -> Option<ServerMessage> {
    let outcome = state
        .reveal_loyalty(game, ActionOrigin::player(user), index)
        .await;
    reply(game, outcome)
}

pub async fn handle_peek_drop(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    drop: bool,
) -> Option<ServerMessage> {
    let outcome = state
        .peek_drop(game, ActionOrigin::player(user), drop)
        .await;
    reply(game, outcome)
}

pub async fn handle_toggle_remake(
    state: &Arc<AppState>,
    user: &str,
    game: &str,
    remake: bool,
) -> Option<ServerMessage> {
    let outcome = state.toggle_remake(user, game, remake).await;
    reply(game, outcome)
}
