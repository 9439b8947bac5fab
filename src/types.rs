use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque ID types
pub type GameKey = String;
pub type UserKey = String;
pub type TimerToken = u64;

/// Smallest and largest table the ruleset supports
pub const MIN_PLAYERS: u32 = 5;
pub const MAX_PLAYERS: u32 = 10;

/// Size of a presidential draw
pub const HAND_SIZE: usize = 3;

/// Consecutive failed elections before the top policy is enacted
pub const ELECTION_TRACKER_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Setup,
    Starting,
    Playing,
    Ended,
    Error,
    Remade,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    SelectingChancellor,
    Voting,
    PresidentSelectingPolicy,
    ChancellorSelectingPolicy,
    ChancellorVoteOnVeto,
    PresidentVoteOnVeto,
    EnactPolicy,
    Powers,
}

/// A faction, and the face of a policy card
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    Liberal,
    Fascist,
}

pub type Policy = Team;

impl Team {
    pub fn as_str(&self) -> &'static str {
        match self {
            Team::Liberal => "liberal",
            Team::Fascist => "fascist",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Liberal,
    Fascist,
    Hitler,
}

impl Role {
    pub fn team(&self) -> Team {
        match self {
            Role::Liberal => Team::Liberal,
            Role::Fascist | Role::Hitler => Team::Fascist,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Liberal => "liberal",
            Role::Fascist => "fascist",
            Role::Hitler => "hitler",
        }
    }
}

/// Presidential powers. The serialized names are shared with replay tooling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Power {
    #[serde(rename = "investigate")]
    Investigate,
    #[serde(rename = "deckpeek")]
    DeckPeek,
    #[serde(rename = "election")]
    SpecialElection,
    #[serde(rename = "bullet")]
    Execution,
    #[serde(rename = "reverseinv")]
    ReverseInvestigate,
    #[serde(rename = "peekdrop")]
    PeekDrop,
}

impl Power {
    /// Instruction narrated when the power is granted
    pub fn instruction(&self) -> &'static str {
        match self {
            Power::Investigate => {
                "The president must investigate the party membership of another player."
            }
            Power::DeckPeek => "The president must examine the top 3 policies.",
            Power::SpecialElection => "The president must select a player for a special election.",
            Power::Execution => "The president must select a player for execution.",
            Power::ReverseInvestigate => {
                "The president must reveal their party membership to another player."
            }
            Power::PeekDrop => "The president must examine the top policy, and may discard it.",
        }
    }
}

/// Named per-game seat sets. Membership is the only record of role and liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {
    Players,
    Present,
    Dead,
    Liberal,
    Fascist,
    Hitler,
    Remake,
    Loader,
    Investigated,
}

impl Group {
    pub const ALL: [Group; 9] = [
        Group::Players,
        Group::Present,
        Group::Dead,
        Group::Liberal,
        Group::Fascist,
        Group::Hitler,
        Group::Remake,
        Group::Loader,
        Group::Investigated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Group::Players => "players",
            Group::Present => "present",
            Group::Dead => "dead",
            Group::Liberal => "liberal",
            Group::Fascist => "fascist",
            Group::Hitler => "hitler",
            Group::Remake => "remake",
            Group::Loader => "loader",
            Group::Investigated => "investigated",
        }
    }
}

/// Server-wide sets of game keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GameSet {
    Active,
    Starting,
    Frozen,
    Remake,
    /// Games whose lock lease expired and need an operator
    Attention,
}

impl GameSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameSet::Active => "active",
            GameSet::Starting => "starting",
            GameSet::Frozen => "frozen",
            GameSet::Remake => "remake",
            GameSet::Attention => "attention",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PolicyCounts {
    pub liberal: u32,
    pub fascist: u32,
}

impl PolicyCounts {
    pub fn new(liberal: u32, fascist: u32) -> Self {
        Self { liberal, fascist }
    }

    pub fn get(&self, team: Team) -> u32 {
        match team {
            Team::Liberal => self.liberal,
            Team::Fascist => self.fascist,
        }
    }

    pub fn get_mut(&mut self, team: Team) -> &mut u32 {
        match team {
            Team::Liberal => &mut self.liberal,
            Team::Fascist => &mut self.fascist,
        }
    }

    pub fn total(&self) -> u32 {
        self.liberal + self.fascist
    }
}

/// Ruleset parameters. Standard games leave `powers` and `fascist_count`
/// unset so they follow the seated player count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rules {
    pub liberal_deck: u32,
    pub fascist_deck: u32,
    pub liberal_track: u32,
    pub fascist_track: u32,
    pub liberal_start: u32,
    pub fascist_start: u32,
    pub hitler_zone: u32,
    pub veto_zone: u32,
    /// Slot `i` is granted when the fascist track reaches `i + 1`
    pub powers: Option<Vec<Option<Power>>>,
    pub fascist_count: Option<u32>,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            liberal_deck: 6,
            fascist_deck: 11,
            liberal_track: 5,
            fascist_track: 6,
            liberal_start: 0,
            fascist_start: 0,
            hitler_zone: 3,
            veto_zone: 5,
            powers: None,
            fascist_count: None,
        }
    }
}

impl Rules {
    /// Validate ruleset invariants for a table of `min_players`
    pub fn validate(&self, min_players: u32) -> Result<(), String> {
        if self.liberal_track == 0 || self.fascist_track < 2 {
            return Err("Track lengths are too short".to_string());
        }
        if self.liberal_deck < self.liberal_track || self.fascist_deck < self.fascist_track {
            return Err("Deck cannot complete a track".to_string());
        }
        // Every track short of a win, plus one full draw
        let playable = (self.liberal_track - 1) + (self.fascist_track - 1) + HAND_SIZE as u32;
        if self.liberal_deck + self.fascist_deck < playable {
            return Err(format!(
                "Deck of {} cards cannot guarantee a full draw (needs {})",
                self.liberal_deck + self.fascist_deck,
                playable
            ));
        }
        if self.liberal_start >= self.liberal_track || self.fascist_start >= self.fascist_track {
            return Err("Starting track is already at a win".to_string());
        }
        if self.hitler_zone < 1 || self.hitler_zone >= self.fascist_track {
            return Err("Hitler zone must lie inside the fascist track".to_string());
        }
        if self.veto_zone <= self.fascist_start || self.veto_zone >= self.fascist_track {
            return Err("Veto zone must lie inside the fascist track".to_string());
        }
        if let Some(ref powers) = self.powers {
            if powers.len() != (self.fascist_track - 1) as usize {
                return Err(format!(
                    "Expected {} power slots, got {}",
                    self.fascist_track - 1,
                    powers.len()
                ));
            }
        }
        if let Some(count) = self.fascist_count {
            // Fascists plus Hitler must stay a minority
            if count < 1 || (count + 1) * 2 >= min_players {
                return Err("Fascist count would not leave a liberal majority".to_string());
            }
        }
        Ok(())
    }

    /// Power granted when the fascist track reaches `fascist_enacted`
    pub fn power_at(&self, fascist_enacted: u32, player_count: usize) -> Option<Power> {
        if fascist_enacted == 0 {
            return None;
        }
        let slot = (fascist_enacted - 1) as usize;
        match self.powers {
            Some(ref powers) => powers.get(slot).copied().flatten(),
            None => standard_powers(player_count).get(slot).copied().flatten(),
        }
    }

    /// Fascists seated alongside Hitler
    pub fn fascists_for(&self, player_count: usize) -> usize {
        match self.fascist_count {
            Some(count) => count as usize,
            None => match player_count {
                0..=6 => 1,
                7..=8 => 2,
                _ => 3,
            },
        }
    }
}

/// The standard power track by table size
pub fn standard_powers(player_count: usize) -> [Option<Power>; 5] {
    use Power::*;
    match player_count {
        0..=6 => [None, None, Some(DeckPeek), Some(Execution), Some(Execution)],
        7..=8 => [
            None,
            Some(Investigate),
            Some(SpecialElection),
            Some(Execution),
            Some(Execution),
        ],
        _ => [
            Some(Investigate),
            Some(Investigate),
            Some(SpecialElection),
            Some(Execution),
            Some(Execution),
        ],
    }
}

/// Write-once game configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameConfig {
    pub name: String,
    pub creator: UserKey,
    pub min_players: u32,
    pub max_players: u32,
    #[serde(default)]
    pub excluded_player_counts: Vec<u32>,
    pub private_password: Option<String>,
    /// Seconds per timed decision
    pub timed_mode: Option<u32>,
    #[serde(default)]
    pub blind_mode: bool,
    #[serde(default)]
    pub disable_observer: bool,
    #[serde(default)]
    pub disable_gamechat: bool,
    #[serde(default)]
    pub custom: bool,
    #[serde(flatten)]
    pub rules: Rules,
    pub created_at: DateTime<Utc>,
}

impl GameConfig {
    pub fn is_private(&self) -> bool {
        self.private_password.is_some()
    }

    /// Whether `count` seated players may start
    pub fn accepts_player_count(&self, count: u32) -> bool {
        count >= self.min_players
            && count <= self.max_players
            && !self.excluded_player_counts.contains(&count)
    }

    /// Smallest startable table strictly above `seated`, if any
    pub fn next_startable_count(&self, seated: u32) -> Option<u32> {
        (self.min_players..=self.max_players)
            .filter(|n| !self.excluded_player_counts.contains(n))
            .find(|n| *n > seated)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CardFront {
    SecretRole,
    Ballot,
    Policy,
}

/// Per-seat card shown at the table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Card {
    pub front: CardFront,
    pub back: Option<String>,
    pub displayed: bool,
    pub flipped: bool,
}

impl Card {
    pub fn secret_role() -> Self {
        Self {
            front: CardFront::SecretRole,
            back: None,
            displayed: false,
            flipped: false,
        }
    }

    pub fn ballot(back: Option<bool>) -> Self {
        Self {
            front: CardFront::Ballot,
            back: back.map(|vote| if vote { "ja" } else { "nein" }.to_string()),
            displayed: true,
            flipped: false,
        }
    }
}

/// Mutable round data. Field names are the persisted vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GameState {
    pub stage: Stage,
    pub phase: Option<Phase>,
    pub status: String,
    pub seats: Vec<UserKey>,
    pub election_count: u32,
    pub president_index: Option<usize>,
    pub president: Option<UserKey>,
    pub chancellor: Option<UserKey>,
    pub pending_chancellor: Option<UserKey>,
    pub previous_president: Option<UserKey>,
    pub previous_chancellor: Option<UserKey>,
    pub special_election_president_index: Option<usize>,
    pub special_election_former_president_index: Option<usize>,
    pub deck: PolicyCounts,
    /// Cards already drawn from `deck` and revealed by a peek; drawn first
    pub top_of_deck: Vec<Policy>,
    pub discard: PolicyCounts,
    pub hand: Vec<Policy>,
    pub enacted: PolicyCounts,
    pub election_tracker_count: u32,
    pub veto_enabled: bool,
    pub ballots: BTreeMap<UserKey, bool>,
    pub notified: Vec<UserKey>,
    pub pending_power: Option<Power>,
    pub powers_granted: Vec<u32>,
    pub winner: Option<Team>,
    pub timer_token: Option<TimerToken>,
    pub deadline: Option<DateTime<Utc>>,
    pub ready_to_start_at: Option<DateTime<Utc>>,
    pub remade_into: Option<GameKey>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl GameState {
    pub fn seat_index(&self, user: &str) -> Option<usize> {
        self.seats.iter().position(|s| s == user)
    }

    /// Cards of `team` not yet enacted or discarded
    pub fn undrawn(&self, team: Team) -> u32 {
        let in_hand = self.hand.iter().filter(|p| **p == team).count() as u32;
        let on_top = self.top_of_deck.iter().filter(|p| **p == team).count() as u32;
        self.deck.get(team) + in_hand + on_top
    }

    /// enacted + undrawn + discard, which must equal the configured total
    pub fn ledger_total(&self, team: Team) -> u32 {
        self.enacted.get(team) + self.undrawn(team) + self.discard.get(team)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GameConfig {
        GameConfig {
            name: "Test".to_string(),
            creator: "alice".to_string(),
            min_players: 7,
            max_players: 9,
            excluded_player_counts: vec![8],
            private_password: None,
            timed_mode: None,
            blind_mode: false,
            disable_observer: false,
            disable_gamechat: false,
            custom: false,
            rules: Rules::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_standard_rules_are_valid() {
        assert!(Rules::default().validate(5).is_ok());
    }

    #[test]
    fn test_rules_reject_short_deck() {
        let rules = Rules {
            liberal_deck: 5,
            fascist_deck: 6,
            ..Rules::default()
        };
        let err = rules.validate(5).unwrap_err();
        assert!(err.contains("full draw"));
    }

    #[test]
    fn test_rules_reject_zones_outside_track() {
        let rules = Rules {
            hitler_zone: 6,
            ..Rules::default()
        };
        assert!(rules.validate(5).is_err());

        let rules = Rules {
            fascist_start: 5,
            veto_zone: 5,
            ..Rules::default()
        };
        assert!(rules.validate(5).is_err());
    }

    #[test]
    fn test_rules_reject_fascist_majority() {
        let rules = Rules {
            fascist_count: Some(2),
            ..Rules::default()
        };
        // 2 fascists + Hitler out of 5 is a majority
        assert!(rules.validate(5).is_err());
        assert!(rules.validate(7).is_ok());
    }

    #[test]
    fn test_power_lookup() {
        let rules = Rules::default();
        assert_eq!(rules.power_at(3, 5), Some(Power::DeckPeek));
        assert_eq!(rules.power_at(1, 5), None);
        assert_eq!(rules.power_at(1, 9), Some(Power::Investigate));
        assert_eq!(rules.power_at(0, 9), None);
        assert_eq!(rules.power_at(6, 9), None);

        let custom = Rules {
            powers: Some(vec![Some(Power::PeekDrop), None, None, None, None]),
            ..Rules::default()
        };
        assert_eq!(custom.power_at(1, 5), Some(Power::PeekDrop));
        assert_eq!(custom.power_at(4, 5), None);
    }

    #[test]
    fn test_player_count_acceptance() {
        let config = config();
        assert!(!config.accepts_player_count(6));
        assert!(config.accepts_player_count(7));
        assert!(!config.accepts_player_count(8));
        assert!(config.accepts_player_count(9));
        assert_eq!(config.next_startable_count(7), Some(9));
        assert_eq!(config.next_startable_count(9), None);
    }

    #[test]
    fn test_config_round_trips_through_flat_hash() {
        let config = config();
        let value = serde_json::to_value(&config).unwrap();
        // Rules are flattened into the config hash
        assert_eq!(value["hitlerZone"], 3);
        assert_eq!(value["minPlayers"], 7);
        let back: GameConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_power_names_are_stable() {
        assert_eq!(
            serde_json::to_value(Power::Execution).unwrap(),
            serde_json::json!("bullet")
        );
        assert_eq!(
            serde_json::to_value(Phase::SelectingChancellor).unwrap(),
            serde_json::json!("selectingChancellor")
        );
    }

    #[test]
    fn test_ledger_counts_hand_and_top_of_deck() {
        let state = GameState {
            deck: PolicyCounts::new(3, 8),
            hand: vec![Team::Liberal, Team::Fascist],
            top_of_deck: vec![Team::Liberal],
            discard: PolicyCounts::new(0, 1),
            enacted: PolicyCounts::new(1, 1),
            ..GameState::default()
        };
        assert_eq!(state.ledger_total(Team::Liberal), 6);
        assert_eq!(state.ledger_total(Team::Fascist), 11);
    }
}
