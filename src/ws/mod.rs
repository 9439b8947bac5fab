pub mod handlers;
pub mod lobby;
pub mod player;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::broadcast::{Delivery, Recipient};
use crate::channel::ChannelEvent;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use crate::types::GameKey;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Identity established by the session layer in front of this server
    pub user: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    tracing::info!("WebSocket connection request: user={:?}", params.user);

    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

/// Per-connection view of what to forward
struct Subscriber {
    user: Option<String>,
    watching: HashSet<GameKey>,
}

impl Subscriber {
    fn wants(&self, delivery: &Delivery) -> bool {
        match &delivery.to {
            Recipient::Game(key) => self.watching.contains(key),
            Recipient::User(user) => self.user.as_deref() == Some(user.as_str()),
            Recipient::Lobby => true,
        }
    }

    async fn chat_for(&self, state: &AppState, event: ChannelEvent) -> Option<ServerMessage> {
        if !self.watching.contains(&event.game) {
            return None;
        }
        let readable = state
            .readable_channels(&event.game, self.user.as_deref())
            .await;
        if !readable.contains(&event.channel) {
            return None;
        }
        Some(ServerMessage::Chat {
            game: event.game,
            channel: event.channel.name(),
            entries: event.entries,
        })
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, params: WsQuery, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let current_game = match params.user.as_deref() {
        Some(user) => state.store.current_game(user).await,
        None => None,
    };
    if let (Some(user), Some(key)) = (params.user.as_deref(), current_game.as_deref()) {
        // Back in the seat after a dropped connection
        if let Err(e) = state.take_seat(user, key, None).await {
            tracing::debug!("Could not restore {} to {}: {}", user, key, e);
        }
    }
    let mut subscriber = Subscriber {
        user: params.user.clone(),
        watching: current_game.iter().cloned().collect(),
    };

    tracing::info!("WebSocket connected: user={:?}", subscriber.user);

    // Send welcome message
    let welcome = ServerMessage::Welcome {
        protocol: "1.0".to_string(),
        user: subscriber.user.clone(),
        current_game: current_game.clone(),
        server_now: chrono::Utc::now().to_rfc3339(),
    };

    if let Ok(msg) = serde_json::to_string(&welcome) {
        if sender.send(Message::Text(msg.into())).await.is_err() {
            tracing::error!("Failed to send welcome message");
            return;
        }
    }

    let mut initial = vec![ServerMessage::GameList {
        games: state.game_summaries().await,
    }];
    if let Some(ref key) = current_game {
        if let Some(game) = state.snapshot(key).await {
            initial.push(ServerMessage::GameUpdate { game });
        }
    }
    for msg in initial {
        if let Ok(json) = serde_json::to_string(&msg) {
            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
    }

    let mut deliveries_rx = state.deliveries.subscribe();
    let mut chat_rx = state.channels.subscribe();

    loop {
        tokio::select! {
            delivery = deliveries_rx.recv() => {
                match delivery {
                    Ok(delivery) => {
                        if !subscriber.wants(&delivery) {
                            continue;
                        }
                        if let Ok(json) = serde_json::to_string(&delivery.msg) {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Connection lagged, skipped {} deliveries", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            event = chat_rx.recv() => {
                match event {
                    Ok(event) => {
                        let Some(msg) = subscriber.chat_for(&state, event).await else {
                            continue;
                        };
                        if let Ok(json) = serde_json::to_string(&msg) {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Connection lagged, skipped {} chat events", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            // Handle client messages
            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Received message: {}", text);

                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => {
                                if let Some(game) = client_msg.game() {
                                    subscriber.watching.insert(game.to_string());
                                }
                                let response = handlers::handle_message(
                                    client_msg,
                                    subscriber.user.as_deref(),
                                    &state,
                                )
                                .await;
                                if let Some(ServerMessage::GameCreated { ref game }) = response {
                                    subscriber.watching.insert(game.clone());
                                }
                                if let Some(response) = response {
                                    if let Ok(json) = serde_json::to_string(&response) {
                                        if sender.send(Message::Text(json.into())).await.is_err() {
                                            tracing::error!("Failed to send response");
                                            break;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Failed to parse client message: {}", e);
                                let error = ServerMessage::error(
                                    "PARSE_ERROR",
                                    format!("Invalid message format: {}", e),
                                );
                                if let Ok(json) = serde_json::to_string(&error) {
                                    let _ = sender.send(Message::Text(json.into())).await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("WebSocket closed");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    tracing::info!("WebSocket connection closed for user: {:?}", subscriber.user);

    if let Some(user) = subscriber.user {
        if let Err(e) = state.disconnect(&user).await {
            tracing::warn!("Failed to release {} after disconnect: {}", user, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChatEntry};
    use crate::state::test_support::*;

    fn subscriber(user: Option<&str>, watching: &[&str]) -> Subscriber {
        Subscriber {
            user: user.map(str::to_string),
            watching: watching.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn test_deliveries_filtered_by_recipient() {
        let sub = subscriber(Some("alice"), &["g1"]);
        let msg = ServerMessage::error("X", "x");
        let to = |to| Delivery {
            to,
            msg: msg.clone(),
        };

        assert!(sub.wants(&to(Recipient::Game("g1".into()))));
        assert!(!sub.wants(&to(Recipient::Game("g2".into()))));
        assert!(sub.wants(&to(Recipient::User("alice".into()))));
        assert!(!sub.wants(&to(Recipient::User("bob".into()))));
        assert!(sub.wants(&to(Recipient::Lobby)));
    }

    #[tokio::test]
    async fn test_chat_forwarded_only_on_readable_channels() {
        let state = AppState::new();
        let key = started_game(&state, 5, request(5, 5)).await;
        let game = load(&state, &key).await;
        let seated = subscriber(Some(game.seats[0].as_str()), &[key.as_str()]);
        let observer = subscriber(None, &[key.as_str()]);

        let event = |channel| ChannelEvent {
            game: key.clone(),
            channel,
            entries: vec![ChatEntry::text("hi")],
        };

        assert!(seated.chat_for(&state, event(Channel::Player)).await.is_some());
        assert!(observer.chat_for(&state, event(Channel::Player)).await.is_none());
        assert!(observer
            .chat_for(&state, event(Channel::Observer))
            .await
            .is_some());
        assert!(seated
            .chat_for(&state, event(Channel::Seat(game.seats[1].clone())))
            .await
            .is_none());

        let elsewhere = subscriber(Some(game.seats[0].as_str()), &[]);
        assert!(elsewhere
            .chat_for(&state, event(Channel::Public))
            .await
            .is_none());
    }
}
