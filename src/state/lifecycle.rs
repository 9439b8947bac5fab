use super::{remake_threshold, text, ActionOutcome, AppState, Table, FROZEN_NOTICE, REMADE_NOTICE};
use crate::channel::{Channel, ChatFragment};
use crate::protocol::CreateGameRequest;
use crate::store::StoreError;
use crate::types::*;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

const MAX_NAME_LEN: usize = 20;
const TIMED_MODE_SECS: std::ops::RangeInclusive<u32> = 2..=600;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("already seated in game {0}")]
    AlreadyInGame(GameKey),

    #[error("game {0} not found")]
    NotFound(GameKey),

    #[error("invalid game settings: {0}")]
    InvalidSettings(String),

    #[error("wrong password")]
    WrongPassword,

    #[error("game is full")]
    GameFull,

    #[error("game has already started")]
    AlreadyStarted,

    #[error("not seated in this game")]
    NotSeated,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::AlreadyInGame(_) => "ALREADY_IN_GAME",
            LifecycleError::NotFound(_) => "GAME_NOT_FOUND",
            LifecycleError::InvalidSettings(_) => "INVALID_SETTINGS",
            LifecycleError::WrongPassword => "WRONG_PASSWORD",
            LifecycleError::GameFull => "GAME_FULL",
            LifecycleError::AlreadyStarted => "ALREADY_STARTED",
            LifecycleError::NotSeated => "NOT_SEATED",
            LifecycleError::Store(_) => "STORE_ERROR",
        }
    }
}

fn validate_request(request: &CreateGameRequest) -> Result<(), String> {
    let name = request.name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(format!("Name must be 1 to {} characters", MAX_NAME_LEN));
    }
    if request.min_players < MIN_PLAYERS
        || request.max_players > MAX_PLAYERS
        || request.min_players > request.max_players
    {
        return Err(format!(
            "Player counts must lie between {} and {}",
            MIN_PLAYERS, MAX_PLAYERS
        ));
    }
    if (request.min_players..=request.max_players)
        .all(|n| request.excluded_player_counts.contains(&n))
    {
        return Err("Every player count is excluded".to_string());
    }
    if let Some(secs) = request.timed_mode {
        if !TIMED_MODE_SECS.contains(&secs) {
            return Err(format!(
                "Timed mode must be {} to {} seconds",
                TIMED_MODE_SECS.start(),
                TIMED_MODE_SECS.end()
            ));
        }
    }
    if let Some(ref rules) = request.custom_rules {
        rules.validate(request.min_players)?;
        let fascists = rules.fascists_for(request.max_players as usize) as u32;
        if fascists + 1 >= request.min_players {
            return Err("Too many fascists for the smallest table".to_string());
        }
    }
    Ok(())
}

/// Hitler, the given number of fascists and liberals for the rest, shuffled
pub(crate) fn deal_roles<R: Rng + ?Sized>(players: usize, fascists: usize, rng: &mut R) -> Vec<Role> {
    let mut roles = vec![Role::Hitler];
    roles.extend(std::iter::repeat(Role::Fascist).take(fascists));
    roles.resize(players.max(roles.len()), Role::Liberal);
    roles.shuffle(rng);
    roles
}

fn elapsed_since(now: DateTime<Utc>, then: DateTime<Utc>) -> std::time::Duration {
    (now - then).to_std().unwrap_or_default()
}

impl AppState {
    /// Generate an unused game key
    async fn new_game_key(&self) -> GameKey {
        for _ in 0..8 {
            if let Some(key) = petname::petname(3, "-") {
                if !self.store.exists(&key).await {
                    return key;
                }
            }
        }
        ulid::Ulid::new().to_string().to_lowercase()
    }

    /// Write config and fresh state for a new game and list it in the lobby
    async fn open_game(&self, config: GameConfig) -> Result<GameKey, LifecycleError> {
        let key = self.new_game_key().await;
        let min_players = config.min_players;
        self.store.put_config(&key, &config).await?;

        let state = GameState {
            stage: Stage::Setup,
            status: format!("Waiting for {} more player(s).", min_players),
            created_at: Some(config.created_at),
            last_activity_at: Some(config.created_at),
            ..GameState::default()
        };
        self.store.save_state(&key, &state).await?;
        self.store.add_to_set(GameSet::Active, &key).await;
        Ok(key)
    }

    pub async fn create_game(
        &self,
        creator: &str,
        request: CreateGameRequest,
    ) -> Result<GameKey, LifecycleError> {
        if let Some(current) = self.store.current_game(creator).await {
            return Err(LifecycleError::AlreadyInGame(current));
        }
        validate_request(&request).map_err(LifecycleError::InvalidSettings)?;

        let config = GameConfig {
            name: request.name.trim().to_string(),
            creator: creator.to_string(),
            min_players: request.min_players,
            max_players: request.max_players,
            excluded_player_counts: request.excluded_player_counts,
            private_password: request.private_password.filter(|p| !p.is_empty()),
            timed_mode: request.timed_mode,
            blind_mode: request.blind_mode,
            disable_observer: request.disable_observer,
            disable_gamechat: request.disable_gamechat,
            custom: request.custom_rules.is_some(),
            rules: request.custom_rules.unwrap_or_default(),
            created_at: Utc::now(),
        };
        let password = config.private_password.clone();
        let key = self.open_game(config).await?;
        tracing::info!(game = %key, creator, "Game created");

        self.take_seat(creator, &key, password.as_deref()).await?;
        Ok(key)
    }

    pub async fn take_seat(
        &self,
        user: &str,
        key: &str,
        password: Option<&str>,
    ) -> Result<(), LifecycleError> {
        let _guard = self.locks.acquire_write(key).await;
        let mut table = self
            .load_table(key)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(key.to_string()))?;

        match self.store.current_game(user).await {
            Some(current) if current != key => return Err(LifecycleError::AlreadyInGame(current)),
            _ => {}
        }
        if table.state.seat_index(user).is_some() {
            // Reconnecting to a seat already held
            self.store.add_to_group(key, Group::Present, user).await;
            if !matches!(table.state.stage, Stage::Ended | Stage::Remade) {
                self.store.set_current_game(user, key).await;
            }
            return Ok(());
        }
        if !matches!(table.state.stage, Stage::Setup | Stage::Starting) {
            return Err(LifecycleError::AlreadyStarted);
        }
        if let Some(ref expected) = table.config.private_password {
            if password != Some(expected.as_str()) {
                return Err(LifecycleError::WrongPassword);
            }
        }
        if table.state.seats.len() >= table.config.max_players as usize {
            return Err(LifecycleError::GameFull);
        }

        table.state.seats.push(user.to_string());
        self.store.add_to_group(key, Group::Players, user).await;
        self.store.add_to_group(key, Group::Present, user).await;
        self.store.set_current_game(user, key).await;
        tracing::info!(game = key, user, "Player seated");

        let joined = table.player_named(user);
        self.narrate(key, Channel::Public, vec![joined, text(" has joined the game.")])
            .await;

        self.check_start_conditions(&mut table).await;
        self.persist(&mut table).await?;
        self.publish_lobby().await;
        Ok(())
    }

    pub async fn leave_game(&self, user: &str, key: &str) -> Result<(), LifecycleError> {
        let _guard = self.locks.acquire_write(key).await;
        let table = self
            .load_table(key)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(key.to_string()))?;
        if table.state.seat_index(user).is_none() {
            return Err(LifecycleError::NotSeated);
        }

        self.store.clear_current_game(user, key).await;
        self.depart(user, table).await
    }

    /// A closed connection leaves the user's current game. A running game
    /// keeps the seat and the pointer so the player can reconnect.
    pub async fn disconnect(&self, user: &str) -> Result<(), LifecycleError> {
        let Some(key) = self.store.current_game(user).await else {
            return Ok(());
        };
        let _guard = self.locks.acquire_write(&key).await;
        let Some(table) = self.load_table(&key).await? else {
            self.store.clear_current_game(user, &key).await;
            return Ok(());
        };
        if table.state.seat_index(user).is_none() {
            return Ok(());
        }

        tracing::info!(game = %key, user, "Player disconnected");
        if table.state.stage != Stage::Playing {
            self.store.clear_current_game(user, &key).await;
        }
        self.depart(user, table).await
    }

    /// Mark a seated user absent. Unseats them before the start, voids
    /// their remake vote, and removes the game once nobody is present.
    /// The caller holds the write lock.
    async fn depart(&self, user: &str, mut table: Table) -> Result<(), LifecycleError> {
        let key = table.key.clone();
        self.store.remove_from_group(&key, Group::Present, user).await;
        self.store.remove_from_group(&key, Group::Remake, user).await;

        if matches!(table.state.stage, Stage::Setup | Stage::Starting) {
            if let Some(index) = table.state.seat_index(user) {
                table.state.seats.remove(index);
            }
            self.store.remove_from_group(&key, Group::Players, user).await;
            tracing::info!(game = %key, user, "Player left before the start");
            if table.state.seats.is_empty() {
                self.remove_game_locked(&key).await;
                return Ok(());
            }
            self.check_start_conditions(&mut table).await;
        } else {
            tracing::info!(game = %key, user, "Player left a running game");
            if self.store.group_size(&key, Group::Present).await == 0 {
                self.remove_game_locked(&key).await;
                return Ok(());
            }
        }

        self.persist(&mut table).await?;
        self.publish_lobby().await;
        Ok(())
    }

    /// Save outside of a round action
    async fn persist(&self, table: &mut Table) -> Result<(), StoreError> {
        table.state.last_activity_at = Some(Utc::now());
        self.store.save_state(&table.key, &table.state).await?;
        self.publish(&table.key).await;
        Ok(())
    }

    /// Move between SETUP and STARTING as the seat count changes
    async fn check_start_conditions(&self, table: &mut Table) {
        let seated = table.state.seats.len() as u32;
        if table.config.accepts_player_count(seated) {
            if table.state.stage != Stage::Starting {
                let delay = chrono::Duration::from_std(self.config.start_delay)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                table.state.stage = Stage::Starting;
                table.state.ready_to_start_at = Some(Utc::now() + delay);
                table.state.status = format!(
                    "Game starts in {} seconds.",
                    self.config.start_delay.as_secs()
                );
                self.store.add_to_set(GameSet::Starting, &table.key).await;
            }
        } else {
            table.state.stage = Stage::Setup;
            table.state.ready_to_start_at = None;
            table.state.status = match table.config.next_startable_count(seated) {
                Some(target) => format!("Waiting for {} more player(s).", target - seated),
                None => "Too many players to start.".to_string(),
            };
            self.store.remove_from_set(GameSet::Starting, &table.key).await;
        }
    }

    /// Start every STARTING game whose delay ran out by `now`
    pub async fn start_ready_games(&self, now: DateTime<Utc>) -> Vec<GameKey> {
        let mut started = Vec::new();
        for key in self.store.set_members(GameSet::Starting).await {
            let _guard = self.locks.acquire_write(&key).await;
            let mut table = match self.load_table(&key).await {
                Ok(Some(table)) => table,
                Ok(None) => {
                    self.store.remove_from_set(GameSet::Starting, &key).await;
                    continue;
                }
                Err(e) => {
                    tracing::error!("Failed to load game {}: {}", key, e);
                    continue;
                }
            };
            let ready = table.state.stage == Stage::Starting
                && table.state.ready_to_start_at.is_some_and(|at| at <= now)
                && table
                    .config
                    .accepts_player_count(table.state.seats.len() as u32);
            if !ready {
                continue;
            }

            self.start_game(&mut table).await;
            self.commit(table).await;
            started.push(key);
        }
        if !started.is_empty() {
            self.publish_lobby().await;
        }
        started
    }

    async fn start_game(&self, table: &mut Table) {
        let key = table.key.clone();
        let players = table.state.seats.len();
        let fascists = table.config.rules.fascists_for(players);
        let (roles, first_president) = {
            let mut rng = rand::rng();
            table.state.seats.shuffle(&mut rng);
            let roles = deal_roles(players, fascists, &mut rng);
            (roles, rng.random_range(0..players.max(1)))
        };
        tracing::info!(game = %key, players, fascists, "Game starting");

        self.store.remove_from_set(GameSet::Starting, &key).await;
        let mut liberals = Vec::new();
        let mut fascist_seats = Vec::new();
        let mut hitler_seat = None;
        for (index, role) in roles.iter().enumerate() {
            let Some(user) = table.seat(index).cloned() else {
                continue;
            };
            match role {
                Role::Liberal => {
                    self.store.add_to_group(&key, Group::Liberal, &user).await;
                    liberals.push(index);
                }
                Role::Fascist => {
                    self.store.add_to_group(&key, Group::Fascist, &user).await;
                    fascist_seats.push(index);
                }
                Role::Hitler => {
                    self.store.add_to_group(&key, Group::Fascist, &user).await;
                    self.store.add_to_group(&key, Group::Hitler, &user).await;
                    hitler_seat = Some(index);
                }
            }
            let mut card = Card::secret_role();
            card.back = Some(role.as_str().to_string());
            card.displayed = true;
            self.store.set_card(&key, &user, card).await;
            self.narrate(
                &key,
                Channel::Seat(user),
                vec![
                    text("Your secret role is "),
                    ChatFragment::Role { role: *role },
                    text("."),
                ],
            )
            .await;
        }

        let rules = &table.config.rules;
        table.state.deck = PolicyCounts::new(
            rules.liberal_deck - rules.liberal_start,
            rules.fascist_deck - rules.fascist_start,
        );
        table.state.enacted = PolicyCounts::new(rules.liberal_start, rules.fascist_start);
        table.state.stage = Stage::Playing;
        table.state.ready_to_start_at = None;
        table.state.president_index = Some(first_president);

        let mut team = vec![text("The fascists are ")];
        for (i, index) in fascist_seats.iter().enumerate() {
            if i > 0 {
                team.push(text(", "));
            }
            team.push(table.player(*index));
        }
        if fascist_seats.is_empty() {
            team.push(text("only Hitler"));
        }
        if let Some(hitler) = hitler_seat {
            team.push(text(". Hitler is "));
            team.push(table.player(hitler));
        }
        team.push(text("."));
        self.narrate(&key, Channel::Fascist, team.clone()).await;
        if players <= 6 {
            self.narrate(&key, Channel::Hitler, team).await;
        } else {
            self.narrate(
                &key,
                Channel::Hitler,
                vec![text("You are Hitler. Your fascists know who you are.")],
            )
            .await;
        }
        self.narrate(
            &key,
            Channel::Liberal,
            vec![text(format!(
                "There are {} liberals at this table. Find Hitler.",
                liberals.len()
            ))],
        )
        .await;
        self.narrate(&key, Channel::Public, vec![text("The game begins.")])
            .await;

        self.start_turn(table, false).await;
    }

    /// Add or withdraw a remake vote
    pub async fn toggle_remake(&self, user: &str, key: &str, remake: bool) -> ActionOutcome {
        let _guard = self.locks.acquire_write(key).await;
        let mut table = match self.load_table(key).await {
            Ok(Some(table)) => table,
            _ => return ActionOutcome::Ignored,
        };
        if self.store.in_set(GameSet::Frozen, key).await {
            return ActionOutcome::Rejected {
                notice: FROZEN_NOTICE.to_string(),
            };
        }
        if table.state.stage == Stage::Remade {
            return ActionOutcome::Rejected {
                notice: REMADE_NOTICE.to_string(),
            };
        }
        if table.state.stage != Stage::Playing || table.state.seat_index(user).is_none() {
            return super::ignored(key, "toggle_remake");
        }

        let changed = if remake {
            self.store.add_to_group(key, Group::Remake, user).await
        } else {
            self.store.remove_from_group(key, Group::Remake, user).await
        };
        if !changed {
            return super::ignored(key, "toggle_remake");
        }

        let votes = self.store.group_size(key, Group::Remake).await;
        let threshold = remake_threshold(
            self.store.group_size(key, Group::Players).await,
            self.store.group_size(key, Group::Fascist).await,
        );
        let voter = if table.config.is_private() {
            table.player_named(user)
        } else {
            text("A player")
        };
        let action = if remake {
            " has voted to remake this game"
        } else {
            " has rescinded their vote to remake this game"
        };
        self.narrate(
            key,
            Channel::Public,
            vec![voter, text(format!("{} ({}/{}).", action, votes, threshold))],
        )
        .await;

        if remake && votes >= threshold {
            if let Err(e) = self.remake_game(&mut table).await {
                tracing::error!("Failed to remake game {}: {}", key, e);
                return ActionOutcome::Ignored;
            }
            return self.commit(table).await;
        }

        // The round step is unchanged, so its deadline stands
        match self.persist(&mut table).await {
            Ok(()) => ActionOutcome::Applied,
            Err(e) => {
                tracing::error!("Failed to save game {}: {}", key, e);
                ActionOutcome::Ignored
            }
        }
    }

    /// Retire the game and open a fresh one with the same settings
    async fn remake_game(&self, table: &mut Table) -> Result<(), LifecycleError> {
        let mut config = table.config.clone();
        config.created_at = Utc::now();
        let new_key = self.open_game(config).await?;
        tracing::info!(game = %table.key, remade_into = %new_key, "Game remade");

        table.state.stage = Stage::Remade;
        table.state.phase = None;
        table.state.pending_power = None;
        table.state.status = "This game has been remade.".to_string();
        table.state.remade_into = Some(new_key.clone());
        self.timers.cancel(&table.key).await;
        self.store.remove_from_set(GameSet::Active, &table.key).await;
        self.store.add_to_set(GameSet::Remake, &table.key).await;

        for user in &table.state.seats {
            self.store.clear_current_game(user, &table.key).await;
            self.alert(
                user,
                &table.key,
                &format!("This game has been remade. The new game is {}.", new_key),
            )
            .await;
        }
        self.narrate(
            &table.key,
            Channel::Public,
            vec![text(format!("The game has been remade as {}.", new_key))],
        )
        .await;
        self.publish_lobby().await;
        Ok(())
    }

    /// Put a moderation hold on a game, or lift it
    pub async fn freeze(&self, key: &str, frozen: bool) -> Result<(), LifecycleError> {
        let _guard = self.locks.acquire_write(key).await;
        let table = self
            .load_table(key)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(key.to_string()))?;

        if frozen {
            self.store.add_to_set(GameSet::Frozen, key).await;
        } else {
            self.store.remove_from_set(GameSet::Frozen, key).await;
        }
        tracing::warn!(game = key, frozen, "Moderation hold changed");
        self.narrate(
            key,
            Channel::Staff,
            vec![text(if frozen {
                "Game frozen."
            } else {
                "Game unfrozen."
            })],
        )
        .await;

        // Re-evaluates the deadline against the new hold
        self.commit(table).await;
        Ok(())
    }

    pub(crate) async fn end_game(&self, table: &mut Table, winner: Team, reason: &str) {
        let verdict = match winner {
            Team::Liberal => "Liberals win the game.",
            Team::Fascist => "Fascists win the game.",
        };
        table.state.stage = Stage::Ended;
        table.state.phase = None;
        table.state.pending_power = None;
        table.state.winner = Some(winner);
        table.state.status = verdict.to_string();
        tracing::info!(game = %table.key, winner = winner.as_str(), reason, "Game over");

        self.narrate(
            &table.key,
            Channel::Public,
            vec![text(format!("{} {}", reason, verdict))],
        )
        .await;
        let liberal = table.state.undrawn(Team::Liberal);
        let fascist = table.state.undrawn(Team::Fascist);
        self.narrate(
            &table.key,
            Channel::Public,
            vec![text(format!(
                "The deck held {} liberal and {} fascist policies.",
                liberal, fascist
            ))],
        )
        .await;

        for (user, mut card) in self.store.cards(&table.key).await {
            card.front = CardFront::SecretRole;
            card.back = Some(self.role_of(&table.key, &user).await.as_str().to_string());
            card.displayed = true;
            card.flipped = true;
            self.store.set_card(&table.key, &user, card).await;
        }
        for user in &table.state.seats {
            self.store.clear_current_game(user, &table.key).await;
        }
        self.publish_lobby().await;
    }

    pub async fn remove_game(&self, key: &str) {
        let _guard = self.locks.acquire_write(key).await;
        self.remove_game_locked(key).await;
    }

    /// Tear a game down. The caller holds its write lock.
    pub(crate) async fn remove_game_locked(&self, key: &str) {
        self.timers.cancel(key).await;
        if let Ok(state) = self.store.load_state(key).await {
            for user in &state.seats {
                self.store.clear_current_game(user, key).await;
            }
        }
        self.store.remove(key).await;
        self.channels.remove(key).await;
        self.locks.forget(key).await;
        tracing::info!(game = key, "Game removed");
        self.publish_lobby().await;
    }

    async fn reapable(&self, key: &str, now: DateTime<Utc>) -> bool {
        let Ok(Some(config)) = self.store.config(key).await else {
            return false;
        };
        let Ok(state) = self.store.load_state(key).await else {
            return false;
        };
        let last = state
            .last_activity_at
            .or(state.created_at)
            .unwrap_or(config.created_at);
        if elapsed_since(now, last) > self.config.idle_game_ttl {
            return true;
        }
        config.is_private()
            && matches!(state.stage, Stage::Setup | Stage::Starting)
            && (state.seats.len() as u32) < config.min_players
            && elapsed_since(now, config.created_at) > self.config.stale_private_lobby_ttl
    }

    /// Remove idle games and stale private lobbies
    pub async fn reap(&self, now: DateTime<Utc>) -> Vec<GameKey> {
        let mut candidates = Vec::new();
        for key in self.store.game_keys().await {
            if self.reapable(&key, now).await {
                candidates.push(key);
            }
        }
        if candidates.is_empty() {
            return candidates;
        }

        let mut reaped = Vec::new();
        let mut guards = std::pin::pin!(self.locks.acquire_each(candidates));
        while let Some(guard) = guards.next().await {
            // Activity may have happened while waiting for the lock
            if self.reapable(guard.key(), now).await {
                self.remove_game_locked(guard.key()).await;
                reaped.push(guard.key().to_string());
            }
        }
        reaped.sort();
        reaped
    }

    /// Periodic housekeeping run by the sweeper task
    pub async fn sweep(&self, now: DateTime<Utc>) {
        self.start_ready_games(now).await;
        let reaped = self.reap(now).await;
        if !reaped.is_empty() {
            tracing::info!("Reaped {} game(s)", reaped.len());
        }

        for key in self.locks.take_flagged().await {
            if self.store.exists(&key).await {
                self.store.add_to_set(GameSet::Attention, &key).await;
                self.narrate(
                    &key,
                    Channel::Staff,
                    vec![text("A lock on this game was force-released.")],
                )
                .await;
                tracing::warn!(game = %key, "Game flagged for attention");
            }
        }

        self.locks.prune().await;
        self.timers.prune().await;
    }
}
