//! WebSocket message dispatch
//!
//! Identity is checked here, then messages go to the lobby or round handlers.

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use std::sync::Arc;

use super::{lobby, player};

/// Handle client messages and return optional response
pub async fn handle_message(
    msg: ClientMessage,
    user: Option<&str>,
    state: &Arc<AppState>,
) -> Option<ServerMessage> {
    // Observers may only read
    let user = match (user, &msg) {
        (_, ClientMessage::ReadChat { game }) => {
            return lobby::handle_read_chat(state, user, game).await;
        }
        (Some(user), _) => user,
        (None, _) => {
            return Some(ServerMessage::error(
                "UNAUTHENTICATED",
                "Connect with a user to take part",
            ));
        }
    };

    match msg {
        ClientMessage::CreateGame(request) => {
            lobby::handle_create_game(state, user, request).await
        }

        ClientMessage::TakeSeat { game, password } => {
            lobby::handle_take_seat(state, user, &game, password.as_deref()).await
        }

        ClientMessage::LeaveGame { game } => lobby::handle_leave_game(state, user, &game).await,

        ClientMessage::ToggleRemake { game, remake } => {
            player::handle_toggle_remake(state, user, &game, remake).await
        }

        ClientMessage::ReadChat { .. } => None,

        ClientMessage::GameChat { game, chat } => {
            lobby::handle_game_chat(state, user, &game, &chat).await
        }

        // Round actions
        ClientMessage::SelectChancellor { game, index } => {
            player::handle_select_chancellor(state, user, &game, index).await
        }

        ClientMessage::Vote { game, vote } => player::handle_vote(state, user, &game, vote).await,

        ClientMessage::PresidentSelectPolicy { game, index } => {
            player::handle_president_select_policy(state, user, &game, index).await
        }

        ClientMessage::ChancellorSelectPolicy { game, index } => {
            player::handle_chancellor_select_policy(state, user, &game, index).await
        }

        ClientMessage::ChancellorVetoVote { game, veto } => {
            player::handle_chancellor_veto_vote(state, user, &game, veto).await
        }

        ClientMessage::PresidentVetoVote { game, veto } => {
            player::handle_president_veto_vote(state, user, &game, veto).await
        }

        ClientMessage::Investigate { game, index } => {
            player::handle_investigate(state, user, &game, index).await
        }

        ClientMessage::ConfirmPolicyPeek { game } => {
            player::handle_confirm_policy_peek(state, user, &game).await
        }

        ClientMessage::SpecialElection { game, index } => {
            player::handle_special_election(state, user, &game, index).await
        }

        ClientMessage::Execute { game, index } => {
            player::handle_execute(state, user, &game, index).await
        }

        ClientMessage::RevealLoyalty { game, index } => {
            player::handle_reveal_loyalty(state, user, &game, index).await
        }

        ClientMessage::PeekDrop { game, drop } => {
            player::handle_peek_drop(state, user, &game, drop).await
        }
    }
}
