use crate::types::{GameKey, Role, Team, UserKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{broadcast, RwLock};
use ulid::Ulid;

/// Per-game audience channels
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Public,
    Player,
    Hitler,
    Liberal,
    Fascist,
    Observer,
    Staff,
    Debug,
    PlayerChat,
    ObserverChat,
    /// Private narration for one seat
    Seat(UserKey),
}

impl Channel {
    pub fn name(&self) -> String {
        match self {
            Channel::Public => "game:public".to_string(),
            Channel::Player => "game:player".to_string(),
            Channel::Hitler => "game:hitler".to_string(),
            Channel::Liberal => "game:liberal".to_string(),
            Channel::Fascist => "game:fascist".to_string(),
            Channel::Observer => "game:observer".to_string(),
            Channel::Staff => "staff".to_string(),
            Channel::Debug => "debug".to_string(),
            Channel::PlayerChat => "chat:player".to_string(),
            Channel::ObserverChat => "chat:observer".to_string(),
            Channel::Seat(user) => format!("seat:{}", user),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Pre-rendered piece of a narration line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatFragment {
    Text { text: String },
    /// A seat; `user` is withheld in blind games
    Player { seat: usize, user: Option<UserKey> },
    Policy { policy: Team },
    Role { role: Role },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatEntry {
    pub id: Ulid,
    pub timestamp: DateTime<Utc>,
    pub chat: Vec<ChatFragment>,
}

impl ChatEntry {
    pub fn new(chat: Vec<ChatFragment>) -> Self {
        Self {
            id: Ulid::new(),
            timestamp: Utc::now(),
            chat,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![ChatFragment::Text { text: text.into() }])
    }

    /// Flatten to plain text
    pub fn render(&self) -> String {
        self.chat
            .iter()
            .map(|fragment| match fragment {
                ChatFragment::Text { text } => text.clone(),
                ChatFragment::Player { seat, user } => match user {
                    Some(user) => format!("{} {{{}}}", user, seat + 1),
                    None => format!("{{{}}}", seat + 1),
                },
                ChatFragment::Policy { policy } => policy.as_str().to_string(),
                ChatFragment::Role { role } => role.as_str().to_string(),
            })
            .collect()
    }
}

/// Entries published on the live feed
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub game: GameKey,
    pub channel: Channel,
    pub entries: Vec<ChatEntry>,
}

/// Append-only narration logs. Uses its own lock so writers never wait on
/// a game lock.
pub struct ChannelBus {
    logs: RwLock<HashMap<GameKey, Vec<(Channel, Vec<ChatEntry>)>>>,
    feed: broadcast::Sender<ChannelEvent>,
}

impl ChannelBus {
    pub fn new() -> Self {
        let (feed, _rx) = broadcast::channel(256);
        Self {
            logs: RwLock::new(HashMap::new()),
            feed,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.feed.subscribe()
    }

    /// Append entries and register the channel as known for the game
    pub async fn write_channel(&self, key: &str, channel: Channel, entries: Vec<ChatEntry>) {
        if entries.is_empty() {
            return;
        }
        {
            let mut logs = self.logs.write().await;
            let channels = logs.entry(key.to_string()).or_default();
            match channels.iter_mut().find(|(c, _)| *c == channel) {
                Some((_, log)) => log.extend(entries.iter().cloned()),
                None => channels.push((channel.clone(), entries.clone())),
            }
        }
        // No live subscribers is fine
        let _ = self.feed.send(ChannelEvent {
            game: key.to_string(),
            channel,
            entries,
        });
    }

    pub async fn write(&self, key: &str, channel: Channel, entry: ChatEntry) {
        self.write_channel(key, channel, vec![entry]).await;
    }

    /// Concatenate logs in the order the channels are given
    pub async fn read_channels(&self, key: &str, channels: &[Channel]) -> Vec<ChatEntry> {
        let logs = self.logs.read().await;
        let Some(known) = logs.get(key) else {
            return Vec::new();
        };
        channels
            .iter()
            .filter_map(|wanted| known.iter().find(|(c, _)| c == wanted))
            .flat_map(|(_, log)| log.iter().cloned())
            .collect()
    }

    pub async fn known_channels(&self, key: &str) -> Vec<Channel> {
        let logs = self.logs.read().await;
        logs.get(key)
            .map(|known| known.iter().map(|(c, _)| c.clone()).collect())
            .unwrap_or_default()
    }

    /// Clear every known channel of a game
    pub async fn remove(&self, key: &str) {
        self.logs.write().await.remove(key);
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}
