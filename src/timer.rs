use crate::types::{GameKey, TimerToken};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Scheduled {
    token: TimerToken,
    deadline: Instant,
    handle: JoinHandle<()>,
}

/// At most one pending deadline per game
pub struct TimerScheduler {
    next_token: AtomicU64,
    timers: Mutex<HashMap<GameKey, Scheduled>>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_token(&self) -> TimerToken {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Schedule `on_expiry` after `delay`, replacing any pending deadline for
    /// the game. Returns the token identifying this deadline.
    pub async fn schedule<F, Fut>(&self, key: &str, delay: Duration, on_expiry: F) -> TimerToken
    where
        F: FnOnce(TimerToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token();
        let deadline = Instant::now() + delay;

        // Registered before the sleep starts so `expired` never misses it
        let mut timers = self.timers.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // Detached so a later cancel cannot interrupt a half-applied action
            tokio::spawn(on_expiry(token));
        });
        let scheduled = Scheduled {
            token,
            deadline,
            handle,
        };
        if let Some(previous) = timers.insert(key.to_string(), scheduled) {
            previous.handle.abort();
            tracing::debug!("Replaced timer {} for game {}", previous.token, key);
        }
        token
    }

    /// Cancel the pending deadline. A no-op when nothing is scheduled.
    pub async fn cancel(&self, key: &str) -> bool {
        match self.timers.lock().await.remove(key) {
            Some(scheduled) => {
                scheduled.handle.abort();
                tracing::debug!("Cancelled timer {} for game {}", scheduled.token, key);
                true
            }
            None => false,
        }
    }

    /// Token of the deadline still waiting to fire
    pub async fn pending(&self, key: &str) -> Option<TimerToken> {
        self.timers
            .lock()
            .await
            .get(key)
            .filter(|s| !s.handle.is_finished())
            .map(|s| s.token)
    }

    /// Whether the deadline identified by `token` has passed. Its callback
    /// may not have applied yet.
    pub async fn expired(&self, key: &str, token: TimerToken) -> bool {
        self.timers
            .lock()
            .await
            .get(key)
            .is_some_and(|s| s.token == token && Instant::now() >= s.deadline)
    }

    /// Drop bookkeeping for deadlines that already fired
    pub async fn prune(&self) {
        self.timers
            .lock()
            .await
            .retain(|_, scheduled| !scheduled.handle.is_finished());
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}
