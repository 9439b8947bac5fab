use super::{text, AppState};
use crate::channel::{Channel, ChatEntry};
use crate::store::StoreError;
use crate::types::*;
use thiserror::Error;

pub const MAX_CHAT_LEN: usize = 300;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat must be 1 to 300 characters")]
    InvalidLength,
    #[error("game {0} not found")]
    NotFound(GameKey),
    #[error("chat is disabled for this game")]
    Disabled,
    #[error("you cannot chat right now")]
    Silenced,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::InvalidLength => "INVALID_CHAT",
            ChatError::NotFound(_) => "GAME_NOT_FOUND",
            ChatError::Disabled => "CHAT_DISABLED",
            ChatError::Silenced => "CHAT_SILENCED",
            ChatError::Store(_) => "STORE_ERROR",
        }
    }
}

impl AppState {
    /// Post a chat line. Seated players write to the player chat and
    /// everyone else to the observer chat. Does not take the game lock.
    pub async fn add_game_chat(
        &self,
        user: &str,
        key: &str,
        chat: &str,
    ) -> Result<Channel, ChatError> {
        let chat = chat.trim();
        if chat.is_empty() || chat.chars().count() > MAX_CHAT_LEN {
            return Err(ChatError::InvalidLength);
        }
        let table = self
            .load_table(key)
            .await?
            .ok_or_else(|| ChatError::NotFound(key.to_string()))?;

        let (channel, speaker) = match table.state.seat_index(user) {
            Some(index) => {
                if table.config.disable_gamechat {
                    return Err(ChatError::Disabled);
                }
                if table.state.stage == Stage::Playing {
                    let legislating = (table.in_phase(Phase::PresidentSelectingPolicy)
                        && table.state.president.as_deref() == Some(user))
                        || (table.in_phase(Phase::ChancellorSelectingPolicy)
                            && table.state.chancellor.as_deref() == Some(user));
                    if !table.is_living(index) || legislating {
                        return Err(ChatError::Silenced);
                    }
                }
                (Channel::PlayerChat, table.player(index))
            }
            None => {
                if table.config.disable_observer {
                    return Err(ChatError::Disabled);
                }
                (Channel::ObserverChat, text(user))
            }
        };

        self.channels
            .write(
                key,
                channel.clone(),
                ChatEntry::new(vec![speaker, text(": "), text(chat)]),
            )
            .await;
        Ok(channel)
    }
}
