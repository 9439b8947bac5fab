use futures::stream::{FuturesUnordered, Stream};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Exclusive hold on one key. Dropping the guard releases it.
#[derive(Debug)]
pub struct WriteGuard {
    key: String,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl WriteGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Explicit release; equivalent to dropping the guard
    pub fn release(self) {}
}

/// Shared hold on one key
#[derive(Debug)]
pub struct ReadGuard {
    key: String,
    _guard: OwnedRwLockReadGuard<()>,
}

impl ReadGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(self) {}
}

/// Per-key read/write locks with a bounded wait.
///
/// A caller that waits longer than the lease assumes the current holder is
/// stuck: the key's lock is swapped for a fresh one, the key is flagged for
/// operator attention and the caller proceeds. The stuck holder's guard keeps
/// pointing at the retired lock and drops without effect.
pub struct KeyedMutex {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    flagged: Mutex<BTreeSet<String>>,
    lease: Duration,
}

impl KeyedMutex {
    pub fn new(lease: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            flagged: Mutex::new(BTreeSet::new()),
            lease,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    async fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    async fn is_current(&self, key: &str, lock: &Arc<RwLock<()>>) -> bool {
        let locks = self.locks.lock().await;
        locks.get(key).is_some_and(|l| Arc::ptr_eq(l, lock))
    }

    async fn force_release(&self, key: &str, stuck: &Arc<RwLock<()>>) {
        {
            let mut locks = self.locks.lock().await;
            // Another waiter may already have replaced it
            if locks.get(key).is_some_and(|l| Arc::ptr_eq(l, stuck)) {
                locks.insert(key.to_string(), Arc::new(RwLock::new(())));
            }
        }
        self.flagged.lock().await.insert(key.to_string());
        tracing::error!(
            "Lock on {} not released within {:?}, forcing release",
            key,
            self.lease
        );
    }

    async fn acquire<G, F, Fut>(&self, key: &str, take: F) -> G
    where
        F: Fn(Arc<RwLock<()>>) -> Fut,
        Fut: Future<Output = G>,
    {
        loop {
            let lock = self.lock_for(key).await;
            match tokio::time::timeout(self.lease, take(lock.clone())).await {
                Ok(guard) => {
                    // A waiter on a retired lock must not run alongside the
                    // holder of its replacement
                    if self.is_current(key, &lock).await {
                        return guard;
                    }
                    tracing::debug!("Acquired retired lock for {}, retrying", key);
                }
                Err(_) => self.force_release(key, &lock).await,
            }
        }
    }

    pub async fn acquire_write(&self, key: &str) -> WriteGuard {
        let guard = self.acquire(key, |lock| lock.write_owned()).await;
        WriteGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    pub async fn acquire_read(&self, key: &str) -> ReadGuard {
        let guard = self.acquire(key, |lock| lock.read_owned()).await;
        ReadGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Write-lock every key in sorted order. The guards release together
    /// when the returned vector is dropped.
    pub async fn acquire_all<S: AsRef<str>>(&self, keys: &[S]) -> Vec<WriteGuard> {
        let keys: BTreeSet<&str> = keys.iter().map(|k| k.as_ref()).collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.acquire_write(key).await);
        }
        guards
    }

    /// Write-lock keys independently, yielding each guard as soon as it is
    /// available. Each guard is released on its own.
    pub fn acquire_each<I>(&self, keys: I) -> impl Stream<Item = WriteGuard> + '_
    where
        I: IntoIterator<Item = String>,
    {
        let keys: BTreeSet<String> = keys.into_iter().collect();
        keys.into_iter()
            .map(|key| async move { self.acquire_write(&key).await })
            .collect::<FuturesUnordered<_>>()
    }

    /// Keys whose lock had to be force-released
    pub async fn flagged(&self) -> Vec<String> {
        self.flagged.lock().await.iter().cloned().collect()
    }

    /// Drain flagged keys
    pub async fn take_flagged(&self) -> Vec<String> {
        std::mem::take(&mut *self.flagged.lock().await)
            .into_iter()
            .collect()
    }

    /// Drop the entry for a key that no longer exists
    pub async fn forget(&self, key: &str) {
        self.locks.lock().await.remove(key);
        self.flagged.lock().await.remove(key);
    }

    /// Drop entries nobody holds or waits on. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn mutex() -> KeyedMutex {
        KeyedMutex::new(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_writer_excludes_writer() {
        let locks = Arc::new(mutex());
        let guard = locks.acquire_write("game").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire_write("game").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        guard.release();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_readers_share_and_exclude_writer() {
        let locks = Arc::new(mutex());
        let r1 = locks.acquire_read("game").await;
        let r2 = locks.acquire_read("game").await;
        assert_eq!(r1.key(), "game");

        let other = locks.clone();
        let writer = tokio::spawn(async move {
            let _g = other.acquire_write("game").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        drop(r1);
        drop(r2);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = mutex();
        let _a = locks.acquire_write("a").await;
        let b = locks.acquire_write("b").await;
        assert_eq!(b.key(), "b");
    }

    #[tokio::test]
    async fn test_acquire_all_sorts_and_dedups() {
        let locks = mutex();
        let guards = locks.acquire_all(&["c", "a", "b", "a"]).await;
        let keys: Vec<&str> = guards.iter().map(|g| g.key()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_acquire_each_yields_available_first() {
        let locks = mutex();
        let held = locks.acquire_write("b").await;

        let mut stream = Box::pin(locks.acquire_each(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
        ]));

        let mut first = vec![
            stream.next().await.unwrap().key().to_string(),
            stream.next().await.unwrap().key().to_string(),
        ];
        first.sort();
        assert_eq!(first, vec!["a", "c"]);

        drop(held);
        let last = stream.next().await.unwrap();
        assert_eq!(last.key(), "b");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_force_releases_and_flags() {
        let locks = KeyedMutex::new(Duration::from_millis(50));
        let stuck = locks.acquire_write("game").await;

        let recovered = locks.acquire_write("game").await;
        assert_eq!(locks.flagged().await, vec!["game".to_string()]);

        // The stuck holder dropping late must not release the new holder
        drop(stuck);
        let blocked = tokio::time::timeout(
            Duration::from_millis(10),
            locks.lock_for("game").await.write_owned(),
        )
        .await;
        assert!(blocked.is_err());

        drop(recovered);
        assert_eq!(locks.take_flagged().await, vec!["game".to_string()]);
        assert!(locks.flagged().await.is_empty());
    }

    #[tokio::test]
    async fn test_prune_and_forget() {
        let locks = mutex();
        let held = locks.acquire_write("a").await;
        drop(locks.acquire_write("b").await);
        assert_eq!(locks.len().await, 2);

        assert_eq!(locks.prune().await, 1);
        assert_eq!(locks.len().await, 1);

        drop(held);
        locks.forget("a").await;
        assert!(locks.is_empty().await);
    }
}
