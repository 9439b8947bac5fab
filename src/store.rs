use crate::types::*;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;

/// A flat JSON hash
pub type Hash = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config for game {0} is already set")]
    ConfigExists(GameKey),

    #[error("field {field} of game {key} is not an integer")]
    NotAnInteger { key: GameKey, field: String },

    #[error("malformed {hash} hash for game {key}: {source}")]
    Malformed {
        key: GameKey,
        hash: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Default)]
struct GameRecord {
    state: Hash,
    config: Hash,
    groups: HashMap<Group, BTreeSet<UserKey>>,
    cards: BTreeMap<UserKey, Card>,
}

/// Keyed game data: state and config hashes, seat groups, cards, server-wide
/// game sets and each user's current game. Unknown keys read as empty.
pub struct GameStateStore {
    games: RwLock<HashMap<GameKey, GameRecord>>,
    sets: RwLock<HashMap<GameSet, BTreeSet<GameKey>>>,
    current_games: RwLock<HashMap<UserKey, GameKey>>,
}

impl GameStateStore {
    pub fn new() -> Self {
        Self {
            games: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
            current_games: RwLock::new(HashMap::new()),
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.games.read().await.contains_key(key)
    }

    pub async fn game_keys(&self) -> Vec<GameKey> {
        let mut keys: Vec<GameKey> = self.games.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    // State hash

    /// Merge fields into the state hash
    pub async fn set_state(&self, key: &str, fields: Hash) {
        let mut games = self.games.write().await;
        let record = games.entry(key.to_string()).or_default();
        record.state.extend(fields);
    }

    pub async fn get_state(&self, key: &str) -> Hash {
        let games = self.games.read().await;
        games.get(key).map(|r| r.state.clone()).unwrap_or_default()
    }

    pub async fn get_state_field(&self, key: &str, field: &str) -> Option<Value> {
        let games = self.games.read().await;
        games.get(key).and_then(|r| r.state.get(field).cloned())
    }

    /// Atomically add `by` to an integer field and return the value it held
    /// before. A missing field counts as zero.
    pub async fn incr_state(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut games = self.games.write().await;
        let record = games.entry(key.to_string()).or_default();
        let before = match record.state.get(field) {
            None | Some(Value::Null) => 0,
            Some(value) => value.as_i64().ok_or_else(|| StoreError::NotAnInteger {
                key: key.to_string(),
                field: field.to_string(),
            })?,
        };
        record
            .state
            .insert(field.to_string(), Value::from(before + by));
        Ok(before)
    }

    pub async fn delete_state(&self, key: &str, fields: &[&str]) {
        let mut games = self.games.write().await;
        if let Some(record) = games.get_mut(key) {
            for field in fields {
                record.state.remove(*field);
            }
        }
    }

    pub async fn load_state(&self, key: &str) -> Result<GameState, StoreError> {
        let hash = self.get_state(key).await;
        serde_json::from_value(Value::Object(hash)).map_err(|source| StoreError::Malformed {
            key: key.to_string(),
            hash: "state",
            source,
        })
    }

    pub async fn save_state(&self, key: &str, state: &GameState) -> Result<(), StoreError> {
        let hash = match serde_json::to_value(state) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Hash::new(),
            Err(source) => {
                return Err(StoreError::Malformed {
                    key: key.to_string(),
                    hash: "state",
                    source,
                })
            }
        };
        self.set_state(key, hash).await;
        Ok(())
    }

    // Config hash

    /// Write the config hash. Config is write-once.
    pub async fn set_config(&self, key: &str, fields: Hash) -> Result<(), StoreError> {
        let mut games = self.games.write().await;
        let record = games.entry(key.to_string()).or_default();
        if !record.config.is_empty() {
            return Err(StoreError::ConfigExists(key.to_string()));
        }
        record.config = fields;
        Ok(())
    }

    pub async fn get_config(&self, key: &str) -> Hash {
        let games = self.games.read().await;
        games.get(key).map(|r| r.config.clone()).unwrap_or_default()
    }

    pub async fn delete_config(&self, key: &str) {
        if let Some(record) = self.games.write().await.get_mut(key) {
            record.config.clear();
        }
    }

    pub async fn put_config(&self, key: &str, config: &GameConfig) -> Result<(), StoreError> {
        let fields = match serde_json::to_value(config) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Hash::new(),
            Err(source) => {
                return Err(StoreError::Malformed {
                    key: key.to_string(),
                    hash: "config",
                    source,
                })
            }
        };
        self.set_config(key, fields).await
    }

    /// Typed config, `None` for unknown games
    pub async fn config(&self, key: &str) -> Result<Option<GameConfig>, StoreError> {
        let hash = self.get_config(key).await;
        if hash.is_empty() {
            return Ok(None);
        }
        serde_json::from_value(Value::Object(hash))
            .map(Some)
            .map_err(|source| StoreError::Malformed {
                key: key.to_string(),
                hash: "config",
                source,
            })
    }

    // Groups

    /// Returns false if the user was already a member
    pub async fn add_to_group(&self, key: &str, group: Group, user: &str) -> bool {
        let mut games = self.games.write().await;
        let record = games.entry(key.to_string()).or_default();
        record
            .groups
            .entry(group)
            .or_default()
            .insert(user.to_string())
    }

    pub async fn remove_from_group(&self, key: &str, group: Group, user: &str) -> bool {
        let mut games = self.games.write().await;
        games
            .get_mut(key)
            .and_then(|r| r.groups.get_mut(&group))
            .is_some_and(|members| members.remove(user))
    }

    pub async fn group_members(&self, key: &str, group: Group) -> Vec<UserKey> {
        let games = self.games.read().await;
        games
            .get(key)
            .and_then(|r| r.groups.get(&group))
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, key: &str, group: Group, user: &str) -> bool {
        let games = self.games.read().await;
        games
            .get(key)
            .and_then(|r| r.groups.get(&group))
            .is_some_and(|members| members.contains(user))
    }

    pub async fn group_size(&self, key: &str, group: Group) -> usize {
        let games = self.games.read().await;
        games
            .get(key)
            .and_then(|r| r.groups.get(&group))
            .map_or(0, |members| members.len())
    }

    /// Every group a user belongs to in a game
    pub async fn groups_of(&self, key: &str, user: &str) -> Vec<Group> {
        let games = self.games.read().await;
        let Some(record) = games.get(key) else {
            return Vec::new();
        };
        let mut groups: Vec<Group> = record
            .groups
            .iter()
            .filter(|(_, members)| members.contains(user))
            .map(|(group, _)| *group)
            .collect();
        groups.sort();
        groups
    }

    pub async fn clear_group(&self, key: &str, group: Group) {
        if let Some(record) = self.games.write().await.get_mut(key) {
            record.groups.remove(&group);
        }
    }

    // Cards

    pub async fn set_card(&self, key: &str, user: &str, card: Card) {
        let mut games = self.games.write().await;
        let record = games.entry(key.to_string()).or_default();
        record.cards.insert(user.to_string(), card);
    }

    pub async fn card(&self, key: &str, user: &str) -> Option<Card> {
        let games = self.games.read().await;
        games.get(key).and_then(|r| r.cards.get(user).cloned())
    }

    pub async fn cards(&self, key: &str) -> BTreeMap<UserKey, Card> {
        let games = self.games.read().await;
        games.get(key).map(|r| r.cards.clone()).unwrap_or_default()
    }

    // Game sets

    pub async fn add_to_set(&self, set: GameSet, key: &str) -> bool {
        self.sets
            .write()
            .await
            .entry(set)
            .or_default()
            .insert(key.to_string())
    }

    pub async fn remove_from_set(&self, set: GameSet, key: &str) -> bool {
        self.sets
            .write()
            .await
            .get_mut(&set)
            .is_some_and(|keys| keys.remove(key))
    }

    pub async fn in_set(&self, set: GameSet, key: &str) -> bool {
        self.sets
            .read()
            .await
            .get(&set)
            .is_some_and(|keys| keys.contains(key))
    }

    pub async fn set_members(&self, set: GameSet) -> Vec<GameKey> {
        self.sets
            .read()
            .await
            .get(&set)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    // Current-game pointers

    pub async fn set_current_game(&self, user: &str, key: &str) {
        self.current_games
            .write()
            .await
            .insert(user.to_string(), key.to_string());
    }

    pub async fn current_game(&self, user: &str) -> Option<GameKey> {
        self.current_games.read().await.get(user).cloned()
    }

    /// Clear the pointer only if it still refers to `key`
    pub async fn clear_current_game(&self, user: &str, key: &str) -> bool {
        let mut pointers = self.current_games.write().await;
        if pointers.get(user).is_some_and(|k| k == key) {
            pointers.remove(user);
            true
        } else {
            false
        }
    }

    /// Drop every record of a game: hashes, groups, cards and set membership
    pub async fn remove(&self, key: &str) {
        self.games.write().await.remove(key);
        let mut sets = self.sets.write().await;
        for keys in sets.values_mut() {
            keys.remove(key);
        }
    }
}

impl Default for GameStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a hash from `(field, value)` pairs
pub fn hash<I, K>(fields: I) -> Hash
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    fields.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unknown_game_reads_empty() {
        let store = GameStateStore::new();
        assert!(store.get_state("nope").await.is_empty());
        assert!(store.config("nope").await.unwrap().is_none());
        assert_eq!(store.load_state("nope").await.unwrap(), GameState::default());
        assert!(store.group_members("nope", Group::Players).await.is_empty());
        assert!(!store.exists("nope").await);
    }

    #[tokio::test]
    async fn test_set_and_delete_state_fields() {
        let store = GameStateStore::new();
        store
            .set_state("g", hash([("status", json!("hi")), ("electionCount", json!(2))]))
            .await;
        store.set_state("g", hash([("status", json!("bye"))])).await;

        assert_eq!(store.get_state_field("g", "status").await, Some(json!("bye")));
        assert_eq!(store.get_state_field("g", "electionCount").await, Some(json!(2)));

        store.delete_state("g", &["status"]).await;
        assert_eq!(store.get_state_field("g", "status").await, None);
    }

    #[tokio::test]
    async fn test_incr_state_returns_previous_value() {
        let store = GameStateStore::new();
        assert_eq!(store.incr_state("g", "tracker", 1).await.unwrap(), 0);
        assert_eq!(store.incr_state("g", "tracker", 1).await.unwrap(), 1);
        assert_eq!(store.get_state_field("g", "tracker").await, Some(json!(2)));

        store.set_state("g", hash([("status", json!("x"))])).await;
        assert!(matches!(
            store.incr_state("g", "status", 1).await,
            Err(StoreError::NotAnInteger { .. })
        ));
    }

    #[tokio::test]
    async fn test_incr_state_is_atomic() {
        let store = Arc::new(GameStateStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.incr_state("g", "n", 1).await.unwrap()
            }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, (0..50).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_typed_state_round_trip() {
        let store = GameStateStore::new();
        let state = GameState {
            stage: Stage::Playing,
            phase: Some(Phase::Voting),
            seats: vec!["a".into(), "b".into()],
            deck: PolicyCounts::new(6, 11),
            ..GameState::default()
        };
        store.save_state("g", &state).await.unwrap();
        assert_eq!(store.get_state_field("g", "phase").await, Some(json!("voting")));
        assert_eq!(store.load_state("g").await.unwrap(), state);

        // Atomic counters and typed access share the hash
        store.incr_state("g", "electionTrackerCount", 1).await.unwrap();
        assert_eq!(store.load_state("g").await.unwrap().election_tracker_count, 1);
    }

    #[tokio::test]
    async fn test_config_is_write_once() {
        let store = GameStateStore::new();
        let config = GameConfig {
            name: "Table".into(),
            creator: "alice".into(),
            min_players: 5,
            max_players: 7,
            excluded_player_counts: vec![],
            private_password: None,
            timed_mode: Some(30),
            blind_mode: false,
            disable_observer: false,
            disable_gamechat: false,
            custom: false,
            rules: Rules::default(),
            created_at: Utc::now(),
        };
        store.put_config("g", &config).await.unwrap();
        assert!(matches!(
            store.put_config("g", &config).await,
            Err(StoreError::ConfigExists(_))
        ));
        assert_eq!(store.config("g").await.unwrap(), Some(config));

        store.delete_config("g").await;
        assert!(store.config("g").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_groups_and_reverse_lookup() {
        let store = GameStateStore::new();
        assert!(store.add_to_group("g", Group::Players, "a").await);
        assert!(!store.add_to_group("g", Group::Players, "a").await);
        store.add_to_group("g", Group::Fascist, "a").await;
        store.add_to_group("g", Group::Hitler, "a").await;
        store.add_to_group("g", Group::Players, "b").await;

        assert_eq!(store.group_size("g", Group::Players).await, 2);
        assert_eq!(
            store.groups_of("g", "a").await,
            vec![Group::Players, Group::Fascist, Group::Hitler]
        );
        assert!(store.remove_from_group("g", Group::Players, "b").await);
        assert!(!store.is_member("g", Group::Players, "b").await);
    }

    #[tokio::test]
    async fn test_remove_clears_game_and_sets() {
        let store = GameStateStore::new();
        store.set_state("g", hash([("status", json!("x"))])).await;
        store.add_to_group("g", Group::Players, "a").await;
        store.set_card("g", "a", Card::secret_role()).await;
        store.add_to_set(GameSet::Active, "g").await;
        store.add_to_set(GameSet::Frozen, "g").await;

        store.remove("g").await;
        assert!(!store.exists("g").await);
        assert!(store.card("g", "a").await.is_none());
        assert!(store.set_members(GameSet::Active).await.is_empty());
        assert!(!store.in_set(GameSet::Frozen, "g").await);
    }

    #[tokio::test]
    async fn test_current_game_pointer() {
        let store = GameStateStore::new();
        store.set_current_game("alice", "g1").await;
        assert!(!store.clear_current_game("alice", "g2").await);
        assert_eq!(store.current_game("alice").await, Some("g1".to_string()));
        assert!(store.clear_current_game("alice", "g1").await);
        assert!(store.current_game("alice").await.is_none());
    }
}
