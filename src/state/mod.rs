mod chat;
mod deck;
mod election;
mod lifecycle;
mod policy;
mod powers;
mod timed;

pub use chat::ChatError;
pub use lifecycle::LifecycleError;

use crate::broadcast::{BroadcastSink, ParticipantSink, Recipient};
use crate::channel::{Channel, ChannelBus, ChatEntry, ChatFragment};
use crate::config::ServerConfig;
use crate::lock::KeyedMutex;
use crate::protocol::{GameSnapshot, GameSummary, SeatView, ServerMessage};
use crate::store::{GameStateStore, StoreError};
use crate::timer::TimerScheduler;
use crate::types::*;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

pub const FROZEN_NOTICE: &str = "A moderator has paused this game. Please wait.";
pub const REMADE_NOTICE: &str = "This game has been remade and can no longer be played.";

/// What became of a round action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Applied,
    /// Wrong phase, wrong actor or invalid target; nothing changed
    Ignored,
    /// The game is on hold; the notice is shown to the actor
    Rejected { notice: String },
}

/// Who submitted a round action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOrigin {
    Player(UserKey),
    /// A deadline expired; acts for whoever the step is waiting on
    Timer(TimerToken),
}

impl ActionOrigin {
    pub fn player(user: impl Into<String>) -> Self {
        ActionOrigin::Player(user.into())
    }
}

/// A game loaded under its write lock
pub(crate) struct Table {
    pub key: GameKey,
    pub config: GameConfig,
    pub state: GameState,
    pub dead: BTreeSet<UserKey>,
}

impl Table {
    pub fn seat(&self, index: usize) -> Option<&UserKey> {
        self.state.seats.get(index)
    }

    pub fn is_living(&self, index: usize) -> bool {
        self.seat(index).is_some_and(|user| !self.dead.contains(user))
    }

    pub fn living(&self) -> Vec<usize> {
        (0..self.state.seats.len())
            .filter(|i| self.is_living(*i))
            .collect()
    }

    pub fn living_count(&self) -> usize {
        self.living().len()
    }

    /// First living seat after `index`, wrapping around the table
    pub fn next_living_after(&self, index: usize) -> usize {
        let n = self.state.seats.len();
        (1..=n)
            .map(|step| (index + step) % n.max(1))
            .find(|i| self.is_living(*i))
            .unwrap_or(index)
    }

    /// Timer-originated actions stand in for the expected actor
    pub fn acts_as(&self, origin: &ActionOrigin, expected: Option<&UserKey>) -> bool {
        match (origin, expected) {
            (_, None) => false,
            (ActionOrigin::Timer(_), Some(_)) => true,
            (ActionOrigin::Player(user), Some(expected)) => user == expected,
        }
    }

    pub fn is_president(&self, origin: &ActionOrigin) -> bool {
        self.acts_as(origin, self.state.president.as_ref())
    }

    pub fn is_chancellor(&self, origin: &ActionOrigin) -> bool {
        self.acts_as(origin, self.state.chancellor.as_ref())
    }

    pub fn in_phase(&self, phase: Phase) -> bool {
        self.state.phase == Some(phase)
    }

    /// Chat fragment for a seat. Names are withheld in blind games.
    pub fn player(&self, index: usize) -> ChatFragment {
        let hide = self.config.blind_mode && self.state.stage != Stage::Ended;
        ChatFragment::Player {
            seat: index,
            user: if hide { None } else { self.seat(index).cloned() },
        }
    }

    pub fn player_named(&self, user: &str) -> ChatFragment {
        match self.state.seat_index(user) {
            Some(index) => self.player(index),
            None => ChatFragment::Text {
                text: user.to_string(),
            },
        }
    }
}

pub(crate) fn text(text: impl Into<String>) -> ChatFragment {
    ChatFragment::Text { text: text.into() }
}

/// Remake votes needed: every seat not on the fascist team
pub fn remake_threshold(players: usize, fascists: usize) -> usize {
    players.saturating_sub(fascists).max(1)
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<GameStateStore>,
    pub locks: Arc<KeyedMutex>,
    pub channels: Arc<ChannelBus>,
    pub timers: Arc<TimerScheduler>,
    /// Feed websocket connections subscribe to
    pub deliveries: Arc<BroadcastSink>,
    pub sink: Arc<dyn ParticipantSink>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let deliveries = Arc::new(BroadcastSink::default());
        Self {
            store: Arc::new(GameStateStore::new()),
            locks: Arc::new(KeyedMutex::new(config.lock_lease)),
            channels: Arc::new(ChannelBus::new()),
            timers: Arc::new(TimerScheduler::new()),
            sink: deliveries.clone(),
            deliveries,
            config: Arc::new(config),
        }
    }

    /// Route deliveries somewhere other than the websocket feed
    pub fn with_sink(mut self, sink: Arc<dyn ParticipantSink>) -> Self {
        self.sink = sink;
        self
    }

    pub(crate) async fn load_table(&self, key: &str) -> Result<Option<Table>, StoreError> {
        let Some(config) = self.store.config(key).await? else {
            return Ok(None);
        };
        let state = self.store.load_state(key).await?;
        let dead = self
            .store
            .group_members(key, Group::Dead)
            .await
            .into_iter()
            .collect();
        Ok(Some(Table {
            key: key.to_string(),
            config,
            state,
            dead,
        }))
    }

    /// Load a game for a round action. The caller must hold the write lock.
    pub(crate) async fn open_table(
        &self,
        key: &str,
        origin: &ActionOrigin,
    ) -> Result<Table, ActionOutcome> {
        let table = match self.load_table(key).await {
            Ok(Some(table)) => table,
            Ok(None) => {
                tracing::debug!("Action on unknown game {}", key);
                return Err(ActionOutcome::Ignored);
            }
            Err(e) => {
                tracing::error!("Failed to load game {}: {}", key, e);
                return Err(ActionOutcome::Ignored);
            }
        };

        if self.store.in_set(GameSet::Frozen, key).await {
            return Err(ActionOutcome::Rejected {
                notice: FROZEN_NOTICE.to_string(),
            });
        }
        if table.state.stage == Stage::Remade {
            return Err(ActionOutcome::Rejected {
                notice: REMADE_NOTICE.to_string(),
            });
        }
        if table.state.stage != Stage::Playing {
            return Err(ActionOutcome::Ignored);
        }

        match origin {
            ActionOrigin::Timer(token) => {
                if table.state.timer_token != Some(*token) {
                    tracing::debug!("Stale timer {} for game {}", token, key);
                    return Err(ActionOutcome::Ignored);
                }
            }
            ActionOrigin::Player(user) => {
                if let Some(token) = table.state.timer_token {
                    if self.timers.expired(key, token).await {
                        tracing::debug!("{} acted after the deadline in game {}", user, key);
                        return Err(ActionOutcome::Ignored);
                    }
                }
            }
        }

        Ok(table)
    }

    /// Persist a mutated game, re-arm its deadline and publish the update
    pub(crate) async fn commit(&self, mut table: Table) -> ActionOutcome {
        self.arm_timer(&mut table).await;
        table.state.last_activity_at = Some(Utc::now());

        if let Err(e) = self.store.save_state(&table.key, &table.state).await {
            tracing::error!("Failed to save game {}: {}", table.key, e);
            return ActionOutcome::Ignored;
        }

        if matches!(table.state.stage, Stage::Playing | Stage::Ended) {
            if let Err(msg) = deck::verify_ledger(&table.state, &table.config.rules) {
                self.report_integrity(&table.key, &msg).await;
            }
        }

        self.publish(&table.key).await;
        ActionOutcome::Applied
    }

    /// Schedule the deadline for the step the game is waiting on, or clear it
    pub(crate) async fn arm_timer(&self, table: &mut Table) {
        let timed_step = table.state.stage == Stage::Playing
            && matches!(
                table.state.phase,
                Some(phase) if phase != Phase::Voting && phase != Phase::EnactPolicy
            );
        let delay = table.config.timed_mode.map(|secs| {
            self.config
                .dev_timed_delay
                .unwrap_or(Duration::from_secs(u64::from(secs)))
        });

        match delay {
            Some(delay) if timed_step && !self.store.in_set(GameSet::Frozen, &table.key).await => {
                let state = self.clone();
                let key = table.key.clone();
                let token = self
                    .timers
                    .schedule(&table.key, delay, move |token| {
                        timed::expire(state, key, token)
                    })
                    .await;
                table.state.timer_token = Some(token);
                table.state.deadline = Some(
                    Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
                );
            }
            _ => {
                self.timers.cancel(&table.key).await;
                table.state.timer_token = None;
                table.state.deadline = None;
            }
        }
    }

    pub(crate) async fn narrate(&self, key: &str, channel: Channel, chat: Vec<ChatFragment>) {
        self.channels.write(key, channel, ChatEntry::new(chat)).await;
    }

    /// Data-integrity problems are logged and reported to staff; play continues
    pub(crate) async fn report_integrity(&self, key: &str, msg: &str) {
        tracing::error!(game = key, "Integrity violation: {}", msg);
        self.channels
            .write(key, Channel::Staff, ChatEntry::text(msg))
            .await;
    }

    pub async fn publish(&self, key: &str) {
        if let Some(game) = self.snapshot(key).await {
            self.sink
                .deliver(
                    Recipient::Game(key.to_string()),
                    ServerMessage::GameUpdate { game },
                )
                .await;
        }
    }

    pub async fn publish_lobby(&self) {
        let games = self.game_summaries().await;
        self.sink
            .deliver(Recipient::Lobby, ServerMessage::GameList { games })
            .await;
    }

    pub async fn alert(&self, user: &str, key: &str, msg: &str) {
        self.sink
            .deliver(
                Recipient::User(user.to_string()),
                ServerMessage::Alert {
                    game: key.to_string(),
                    msg: msg.to_string(),
                },
            )
            .await;
    }

    pub(crate) async fn role_of(&self, key: &str, user: &str) -> Role {
        let groups = self.store.groups_of(key, user).await;
        if groups.contains(&Group::Hitler) {
            Role::Hitler
        } else if groups.contains(&Group::Fascist) {
            Role::Fascist
        } else {
            Role::Liberal
        }
    }

    /// Public view of a game. Lock-free; may be momentarily stale.
    pub async fn snapshot(&self, key: &str) -> Option<GameSnapshot> {
        let config = self.store.config(key).await.ok()??;
        let state = self.store.load_state(key).await.ok()?;
        let present = self.store.group_members(key, Group::Present).await;
        let dead = self.store.group_members(key, Group::Dead).await;
        let cards = self.store.cards(key).await;
        let ended = state.stage == Stage::Ended;
        let hide_names = config.blind_mode && !ended;

        let mut seats = Vec::with_capacity(state.seats.len());
        for user in &state.seats {
            let role = if ended {
                Some(self.role_of(key, user).await)
            } else {
                None
            };
            let card = cards.get(user).cloned().map(|mut card| {
                if !card.flipped {
                    card.back = None;
                }
                card
            });
            seats.push(SeatView {
                user: if hide_names { None } else { Some(user.clone()) },
                present: present.contains(user),
                dead: dead.contains(user),
                voted: state.ballots.contains_key(user),
                ballot: if state.phase == Some(Phase::Voting) {
                    None
                } else {
                    state.ballots.get(user).copied()
                },
                role,
                card,
            });
        }

        let index_of = |user: &Option<UserKey>| user.as_deref().and_then(|u| state.seat_index(u));
        let players = self.store.group_size(key, Group::Players).await;
        let fascists = self.store.group_size(key, Group::Fascist).await;

        Some(GameSnapshot {
            key: key.to_string(),
            name: config.name.clone(),
            stage: state.stage,
            phase: state.phase,
            status: state.status.clone(),
            president: index_of(&state.president),
            chancellor: index_of(&state.chancellor),
            pending_chancellor: index_of(&state.pending_chancellor),
            previous_president: index_of(&state.previous_president),
            previous_chancellor: index_of(&state.previous_chancellor),
            seats,
            election_count: state.election_count,
            deck_size: state.deck.total() + state.top_of_deck.len() as u32,
            discard_size: state.discard.total(),
            enacted: state.enacted,
            liberal_track: config.rules.liberal_track,
            fascist_track: config.rules.fascist_track,
            election_tracker_count: state.election_tracker_count,
            veto_enabled: state.veto_enabled,
            pending_power: state.pending_power,
            winner: state.winner,
            deadline: state.deadline,
            timed_mode: config.timed_mode,
            blind_mode: config.blind_mode,
            is_private: config.is_private(),
            remake_votes: self.store.group_size(key, Group::Remake).await,
            remake_threshold: remake_threshold(players, fascists),
            remade_into: state.remade_into.clone(),
        })
    }

    /// Lobby list of active games. Lock-free.
    pub async fn game_summaries(&self) -> Vec<GameSummary> {
        let mut games = Vec::new();
        for key in self.store.set_members(GameSet::Active).await {
            let Ok(Some(config)) = self.store.config(&key).await else {
                continue;
            };
            let Ok(state) = self.store.load_state(&key).await else {
                continue;
            };
            games.push(GameSummary {
                key,
                name: config.name.clone(),
                stage: state.stage,
                seated: state.seats.len(),
                min_players: config.min_players,
                max_players: config.max_players,
                is_private: config.is_private(),
                timed_mode: config.timed_mode,
                custom: config.custom,
            });
        }
        games
    }

    /// Channels `user` may read, in display order. `None` is an anonymous observer.
    pub async fn readable_channels(&self, key: &str, user: Option<&str>) -> Vec<Channel> {
        let Ok(Some(config)) = self.store.config(key).await else {
            return Vec::new();
        };
        let state = self.store.load_state(key).await.unwrap_or_default();
        let ended = state.stage == Stage::Ended;

        let mut channels = vec![Channel::Public];
        if ended {
            channels.extend([Channel::Liberal, Channel::Fascist, Channel::Hitler]);
        }

        match user.filter(|u| state.seats.iter().any(|s| s == u)) {
            Some(user) => {
                channels.push(Channel::Player);
                if !ended {
                    let groups = self.store.groups_of(key, user).await;
                    if groups.contains(&Group::Liberal) {
                        channels.push(Channel::Liberal);
                    }
                    if groups.contains(&Group::Hitler) {
                        channels.push(Channel::Hitler);
                        // Hitler only knows the fascists at small tables
                        if state.seats.len() <= 6 {
                            channels.push(Channel::Fascist);
                        }
                    } else if groups.contains(&Group::Fascist) {
                        channels.push(Channel::Fascist);
                    }
                }
                if !config.disable_gamechat {
                    channels.push(Channel::PlayerChat);
                }
                channels.push(Channel::Seat(user.to_string()));
            }
            None => {
                if !config.disable_observer {
                    channels.push(Channel::Observer);
                    channels.push(Channel::ObserverChat);
                }
            }
        }
        channels
    }

    pub async fn chat_history(&self, key: &str, user: Option<&str>) -> Vec<ChatEntry> {
        let channels = self.readable_channels(key, user).await;
        self.channels.read_channels(key, &channels).await
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn ignored(key: &str, action: &str) -> ActionOutcome {
    tracing::debug!("Ignored {} in game {}", action, key);
    ActionOutcome::Ignored
}
