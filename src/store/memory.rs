//! In-process counter store.
//!
//! Counters, block flags and policies live in separate concurrent maps, so the
//! record families never collide. Expiry is evaluated lazily against the
//! injected [`Clock`] and swept by [`CounterStore::purge_expired`].

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::CounterStore;
use crate::error::Result;
use crate::ratelimit::LimitPolicy;

/// A request count within one fixed window.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: i64,
    /// Fixed when the window opens; increments never move it.
    expires_at: Instant,
}

impl WindowCounter {
    fn open(now: Instant, window_seconds: i64) -> Self {
        Self {
            count: 0,
            expires_at: now + seconds(window_seconds),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

fn seconds(value: i64) -> Duration {
    Duration::from_secs(value.max(0) as u64)
}

/// Counter store kept in process memory.
///
/// Suitable for a single gate instance; state is lost on restart.
#[derive(Debug)]
pub struct MemoryStore {
    counters: DashMap<String, WindowCounter>,
    flags: DashMap<String, Instant>,
    policies: DashMap<String, LimitPolicy>,
    policy_ids: DashMap<String, String>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            flags: DashMap::new(),
            policies: DashMap::new(),
            policy_ids: DashMap::new(),
            clock,
        }
    }

    /// Current count for `key`, or `None` when absent or expired.
    pub fn counter_value(&self, key: &str) -> Option<i64> {
        let now = self.clock.now();
        self.counters
            .get(key)
            .filter(|counter| !counter.is_expired(now))
            .map(|counter| counter.count)
    }

    /// Time left in the current window for `key`.
    pub fn counter_ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.counters
            .get(key)
            .filter(|counter| !counter.is_expired(now))
            .map(|counter| counter.expires_at - now)
    }

    /// Number of counters and flags currently held, expired or not.
    pub fn entry_count(&self) -> usize {
        self.counters.len() + self.flags.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_with_window(&self, key: &str, window_seconds: i64) -> Result<i64> {
        let now = self.clock.now();
        // The entry guard holds the shard lock, which makes read-reset-increment atomic.
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter::open(now, window_seconds));

        if counter.is_expired(now) {
            *counter = WindowCounter::open(now, window_seconds);
        }
        counter.count += 1;

        trace!(key, count = counter.count, "Incremented window counter");
        Ok(counter.count)
    }

    async fn set_flag(&self, key: &str, ttl_seconds: i64) -> Result<()> {
        if ttl_seconds <= 0 {
            self.flags.remove(key);
            return Ok(());
        }
        let expires_at = self.clock.now() + seconds(ttl_seconds);
        self.flags.insert(key.to_string(), expires_at);
        Ok(())
    }

    async fn get_flag(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        if self
            .flags
            .remove_if(key, |_, expires_at| now >= *expires_at)
            .is_some()
        {
            return Ok(false);
        }
        Ok(self.flags.contains_key(key))
    }

    async fn save_policy(&self, key: &str, policy: &LimitPolicy) -> Result<()> {
        self.policies.insert(key.to_string(), policy.clone());
        self.policy_ids.insert(policy.policy_id.clone(), key.to_string());
        Ok(())
    }

    async fn save_policy_if_absent(&self, key: &str, policy: &LimitPolicy) -> Result<bool> {
        match self.policies.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(policy.clone());
                self.policy_ids.insert(policy.policy_id.clone(), key.to_string());
                Ok(true)
            }
        }
    }

    async fn find_policy_key(&self, policy_id: &str) -> Result<Option<String>> {
        Ok(self.policy_ids.get(policy_id).map(|entry| entry.value().clone()))
    }

    async fn load_policy(&self, key: &str) -> Result<Option<LimitPolicy>> {
        Ok(self.policies.get(key).map(|entry| entry.value().clone()))
    }

    async fn list_policy_keys(&self) -> Result<Vec<String>> {
        Ok(self.policies.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let before = self.entry_count();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        self.flags.retain(|_, expires_at| now < *expires_at);
        Ok(before.saturating_sub(self.entry_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::clock::MockClock;

    fn store_with_clock() -> (MemoryStore, MockClock) {
        let clock = MockClock::default();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_increment_counts_within_window() {
        let (store, _clock) = store_with_clock();

        assert_eq!(store.increment_with_window("a", 60).await.unwrap(), 1);
        assert_eq!(store.increment_with_window("a", 60).await.unwrap(), 2);
        assert_eq!(store.increment_with_window("b", 60).await.unwrap(), 1);
        assert_eq!(store.counter_value("a"), Some(2));
    }

    #[tokio::test]
    async fn test_increment_never_extends_window() {
        let (store, clock) = store_with_clock();

        store.increment_with_window("a", 10).await.unwrap();
        clock.advance(Duration::from_secs(6));
        store.increment_with_window("a", 10).await.unwrap();

        // Window still closes 10s after the first increment
        assert_eq!(store.counter_ttl("a"), Some(Duration::from_secs(4)));

        clock.advance(Duration::from_secs(4));
        assert_eq!(store.counter_value("a"), None);
        assert_eq!(store.increment_with_window("a", 10).await.unwrap(), 1);
        assert_eq!(store.counter_ttl("a"), Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_sustained_traffic_does_not_keep_window_open() {
        let (store, clock) = store_with_clock();

        for _ in 0..5 {
            store.increment_with_window("a", 5).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }

        // Five seconds in, the window has rolled over despite a request every second
        assert_eq!(store.increment_with_window("a", 5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_flag_expires() {
        let (store, clock) = store_with_clock();

        assert!(!store.get_flag("a").await.unwrap());
        store.set_flag("a", 30).await.unwrap();
        assert!(store.get_flag("a").await.unwrap());

        clock.advance(Duration::from_secs(29));
        assert!(store.get_flag("a").await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(!store.get_flag("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_flag_is_already_expired() {
        let (store, _clock) = store_with_clock();

        store.set_flag("a", 0).await.unwrap();
        assert!(!store.get_flag("a").await.unwrap());
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_policies_persist_without_expiry() {
        let (store, clock) = store_with_clock();
        let policy = LimitPolicy::new("a", 60, 2, 300);

        store.save_policy("a", &policy).await.unwrap();
        clock.advance(Duration::from_secs(86_400 * 30));

        assert_eq!(store.load_policy("a").await.unwrap(), Some(policy));
        assert_eq!(store.load_policy("b").await.unwrap(), None);
        assert_eq!(store.list_policy_keys().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_save_if_absent_keeps_existing_record() {
        let (store, _clock) = store_with_clock();
        let first = LimitPolicy::new("a", 60, 2, 300);
        let second = LimitPolicy::new("a", 1, 10, 60);

        assert!(store.save_policy_if_absent("a", &first).await.unwrap());
        assert!(!store.save_policy_if_absent("a", &second).await.unwrap());

        assert_eq!(store.load_policy("a").await.unwrap(), Some(first.clone()));
        assert_eq!(
            store.find_policy_key(&first.policy_id).await.unwrap(),
            Some("a".to_string())
        );
        assert_eq!(store.find_policy_key(&second.policy_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_drops_only_expired_entries() {
        let (store, clock) = store_with_clock();

        store.increment_with_window("short", 1).await.unwrap();
        store.increment_with_window("long", 60).await.unwrap();
        store.set_flag("short", 1).await.unwrap();
        store.set_flag("long", 60).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired().await.unwrap(), 2);
        assert_eq!(store.entry_count(), 2);
        assert_eq!(store.counter_value("long"), Some(1));
    }
}
