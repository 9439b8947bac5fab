use crate::channel::ChatEntry;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound websocket messages. The acting user comes from the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateGame(CreateGameRequest),
    TakeSeat {
        game: GameKey,
        password: Option<String>,
    },
    LeaveGame {
        game: GameKey,
    },
    SelectChancellor {
        game: GameKey,
        index: usize,
    },
    Vote {
        game: GameKey,
        vote: bool,
    },
    /// Index of the card the president discards
    PresidentSelectPolicy {
        game: GameKey,
        index: usize,
    },
    /// Index of the card the chancellor enacts
    ChancellorSelectPolicy {
        game: GameKey,
        index: usize,
    },
    ChancellorVetoVote {
        game: GameKey,
        veto: bool,
    },
    PresidentVetoVote {
        game: GameKey,
        veto: bool,
    },
    Investigate {
        game: GameKey,
        index: usize,
    },
    ConfirmPolicyPeek {
        game: GameKey,
    },
    SpecialElection {
        game: GameKey,
        index: usize,
    },
    Execute {
        game: GameKey,
        index: usize,
    },
    RevealLoyalty {
        game: GameKey,
        index: usize,
    },
    PeekDrop {
        game: GameKey,
        drop: bool,
    },
    ToggleRemake {
        game: GameKey,
        remake: bool,
    },
    ReadChat {
        game: GameKey,
    },
    GameChat {
        game: GameKey,
        chat: String,
    },
}

impl ClientMessage {
    pub fn game(&self) -> Option<&str> {
        match self {
            ClientMessage::CreateGame(_) => None,
            ClientMessage::TakeSeat { game, .. }
            | ClientMessage::LeaveGame { game }
            | ClientMessage::SelectChancellor { game, .. }
            | ClientMessage::Vote { game, .. }
            | ClientMessage::PresidentSelectPolicy { game, .. }
            | ClientMessage::ChancellorSelectPolicy { game, .. }
            | ClientMessage::ChancellorVetoVote { game, .. }
            | ClientMessage::PresidentVetoVote { game, .. }
            | ClientMessage::Investigate { game, .. }
            | ClientMessage::ConfirmPolicyPeek { game }
            | ClientMessage::SpecialElection { game, .. }
            | ClientMessage::Execute { game, .. }
            | ClientMessage::RevealLoyalty { game, .. }
            | ClientMessage::PeekDrop { game, .. }
            | ClientMessage::ToggleRemake { game, .. }
            | ClientMessage::ReadChat { game }
            | ClientMessage::GameChat { game, .. } => Some(game),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateGameRequest {
    pub name: String,
    pub min_players: u32,
    pub max_players: u32,
    #[serde(default)]
    pub excluded_player_counts: Vec<u32>,
    pub private_password: Option<String>,
    pub timed_mode: Option<u32>,
    #[serde(default)]
    pub blind_mode: bool,
    #[serde(default)]
    pub disable_observer: bool,
    #[serde(default)]
    pub disable_gamechat: bool,
    /// Custom ruleset; standard rules when absent
    pub custom_rules: Option<Rules>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        protocol: String,
        user: Option<UserKey>,
        current_game: Option<GameKey>,
        server_now: String,
    },
    GameCreated {
        game: GameKey,
    },
    GameUpdate {
        game: GameSnapshot,
    },
    Chat {
        game: GameKey,
        channel: String,
        entries: Vec<ChatEntry>,
    },
    ChatHistory {
        game: GameKey,
        entries: Vec<ChatEntry>,
    },
    /// User-visible notice, e.g. a rejected action
    Alert {
        game: GameKey,
        msg: String,
    },
    GameList {
        games: Vec<GameSummary>,
    },
    Error {
        code: String,
        msg: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, msg: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            msg: msg.into(),
        }
    }
}

/// Public view of one seat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeatView {
    /// Hidden in blind mode until the game ends
    pub user: Option<UserKey>,
    pub present: bool,
    pub dead: bool,
    pub voted: bool,
    pub ballot: Option<bool>,
    /// Only revealed once the game has ended
    pub role: Option<Role>,
    pub card: Option<Card>,
}

/// Public view of a game. Government seats are positional so blind mode
/// does not leak names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameSnapshot {
    pub key: GameKey,
    pub name: String,
    pub stage: Stage,
    pub phase: Option<Phase>,
    pub status: String,
    pub seats: Vec<SeatView>,
    pub president: Option<usize>,
    pub chancellor: Option<usize>,
    pub pending_chancellor: Option<usize>,
    pub previous_president: Option<usize>,
    pub previous_chancellor: Option<usize>,
    pub election_count: u32,
    pub deck_size: u32,
    pub discard_size: u32,
    pub enacted: PolicyCounts,
    pub liberal_track: u32,
    pub fascist_track: u32,
    pub election_tracker_count: u32,
    pub veto_enabled: bool,
    pub pending_power: Option<Power>,
    pub winner: Option<Team>,
    pub deadline: Option<DateTime<Utc>>,
    pub timed_mode: Option<u32>,
    pub blind_mode: bool,
    pub is_private: bool,
    pub remake_votes: usize,
    pub remake_threshold: usize,
    pub remade_into: Option<GameKey>,
}

/// Lobby list entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameSummary {
    pub key: GameKey,
    pub name: String,
    pub stage: Stage,
    pub seated: usize,
    pub min_players: u32,
    pub max_players: u32,
    pub is_private: bool,
    pub timed_mode: Option<u32>,
    pub custom: bool,
}
