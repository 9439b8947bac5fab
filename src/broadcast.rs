use crate::protocol::ServerMessage;
use crate::state::AppState;
use crate::types::{GameKey, UserKey};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Who a message is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// Everyone watching a game, seated or not
    Game(GameKey),
    User(UserKey),
    /// Every connected client
    Lobby,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub to: Recipient,
    pub msg: ServerMessage,
}

/// Outbound delivery to participants. The round engine only talks to this.
#[async_trait]
pub trait ParticipantSink: Send + Sync {
    async fn deliver(&self, to: Recipient, msg: ServerMessage);
}

/// Fans deliveries out to websocket connections, which filter by recipient
pub struct BroadcastSink {
    tx: broadcast::Sender<Delivery>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ParticipantSink for BroadcastSink {
    async fn deliver(&self, to: Recipient, msg: ServerMessage) {
        // Ignore send errors (no receivers connected is fine)
        let _ = self.tx.send(Delivery { to, msg });
    }
}

/// Spawn a background task that starts ready games, reaps abandoned ones and
/// prunes idle lock and timer bookkeeping
pub fn spawn_lifecycle_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let interval = state.config.sweep_interval;
        loop {
            tokio::time::sleep(interval).await;
            state.sweep(chrono::Utc::now()).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::default();
        let mut rx = sink.subscribe();

        sink.deliver(
            Recipient::User("alice".to_string()),
            ServerMessage::error("X", "y"),
        )
        .await;

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.to, Recipient::User("alice".to_string()));
    }

    #[tokio::test]
    async fn test_deliver_without_subscribers_is_fine() {
        let sink = BroadcastSink::default();
        sink.deliver(Recipient::Lobby, ServerMessage::error("X", "y"))
            .await;
    }
}
