use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{expires_after, ttl_secs, window_start, CounterStore, MarkerOutcome, StoreError};
use crate::types::now_millis;

enum Value {
    Sorted(BTreeSet<(i64, String)>),
    Text(String),
}

struct Entry {
    value: Value,
    /// Wall-clock expiry in epoch milliseconds.
    expires_at: Option<i64>,
}

impl Entry {
    fn sorted() -> Self {
        Self {
            value: Value::Sorted(BTreeSet::new()),
            expires_at: None,
        }
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

/// A process-local [`CounterStore`] backed by [`DashMap`].
///
/// Each key's state lives behind its shard lock, which makes
/// [`admit_marker`](CounterStore::admit_marker) atomic per key. Expired keys
/// are hidden from reads immediately and evicted by [`cleanup`](Self::cleanup).
pub struct InMemoryCounterStore {
    entries: DashMap<String, Entry>,
    available: AtomicBool,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every command fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remove every expired key.
    pub fn cleanup(&self) {
        let now = now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "evicted expired counter keys");
        }
    }

    /// Spawn a Tokio task that calls [`cleanup`](Self::cleanup) every
    /// `interval` for as long as the store is alive.
    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => store.cleanup(),
                    None => break,
                }
                tracing::trace!("counter store cleanup tick completed");
            }
        });
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store disabled".into()))
        }
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::Corrupt {
            key: key.to_string(),
            value: "operation against a key holding the wrong kind of value".into(),
        }
    }

    /// Run `f` against the live sorted set at `key`, creating it if needed.
    fn with_sorted_mut<T>(
        &self,
        key: &str,
        now: i64,
        f: impl FnOnce(&mut BTreeSet<(i64, String)>, &mut Option<i64>) -> T,
    ) -> Result<T, StoreError> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(Entry::sorted);
        if entry.is_expired(now) {
            *entry = Entry::sorted();
        }
        let Entry { value, expires_at } = &mut *entry;
        match value {
            Value::Sorted(set) => Ok(f(set, expires_at)),
            Value::Text(_) => Err(Self::wrong_type(key)),
        }
    }

    fn with_sorted<T>(
        &self,
        key: &str,
        f: impl FnOnce(&BTreeSet<(i64, String)>) -> T,
    ) -> Result<Option<T>, StoreError> {
        let now = now_millis();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::Sorted(set) => Ok(Some(f(set))),
                Value::Text(_) => Err(Self::wrong_type(key)),
            },
            _ => Ok(None),
        }
    }
}

fn count_from(set: &BTreeSet<(i64, String)>, min_score: i64) -> u64 {
    set.range((min_score, String::new())..).count() as u64
}

fn prune_below(set: &mut BTreeSet<(i64, String)>, max_score: i64) -> u64 {
    let before = set.len();
    *set = set.split_off(&(max_score, String::new()));
    (before - set.len()) as u64
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.with_sorted_mut(key, now_millis(), |set, _| {
            set.retain(|(_, m)| m != member);
            set.insert((score, member.to_string()));
        })
    }

    async fn zcount(&self, key: &str, min_score: i64) -> Result<u64, StoreError> {
        self.ensure_available()?;
        Ok(self
            .with_sorted(key, |set| count_from(set, min_score))?
            .unwrap_or(0))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_available()?;
        Ok(self.with_sorted(key, |set| set.len() as u64)?.unwrap_or(0))
    }

    async fn zremrangebyscore(&self, key: &str, max_score: i64) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let now = now_millis();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => match &mut entry.value {
                Value::Sorted(set) => Ok(prune_below(set, max_score)),
                Value::Text(_) => Err(Self::wrong_type(key)),
            },
            _ => Ok(0),
        }
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.ensure_available()?;
        let now = now_millis();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = Some(expires_after(now, ttl_secs));
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_available()?;
        let now = now_millis();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::Text(text) => Ok(Some(text.clone())),
                Value::Sorted(_) => Err(Self::wrong_type(key)),
            },
            _ => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.ensure_available()?;
        let now = now_millis();
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(expires_after(now, ttl_secs)),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let now = now_millis();
        let removed = keys
            .iter()
            .filter_map(|key| self.entries.remove(key))
            .filter(|(_, entry)| !entry.is_expired(now))
            .count();
        Ok(removed as u64)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_available()?;
        let matcher = glob::Pattern::new(pattern).map_err(|e| StoreError::Pattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        let now = now_millis();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now) && matcher.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }

    async fn admit_marker(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: u64,
        limit: u64,
        member: &str,
    ) -> Result<MarkerOutcome, StoreError> {
        self.ensure_available()?;
        let window_start = window_start(now_ms, window_ms);
        self.with_sorted_mut(key, now_millis(), |set, expires_at| {
            prune_below(set, window_start);
            let count = count_from(set, window_start);
            if count >= limit {
                return MarkerOutcome {
                    count,
                    inserted: false,
                };
            }
            set.insert((now_ms, member.to_string()));
            *expires_at = Some(expires_after(now_ms, ttl_secs(window_ms)));
            MarkerOutcome {
                count: count + 1,
                inserted: true,
            }
        })
    }
}
