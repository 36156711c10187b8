// ABOUTME: Time-to-live cache with atomic whole-entry replacement
// ABOUTME: Readers get an Arc snapshot and never observe a partially written entry

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Result of a cache lookup.
#[derive(Debug)]
pub enum Lookup<V> {
    Fresh(Arc<V>),
    Stale(Arc<V>),
    Missing,
}

impl<V> Lookup<V> {
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Fresh(_) => "hit",
            Self::Stale(_) => "stale",
            Self::Missing => "miss",
        }
    }
}

struct Entry<V> {
    value: Arc<V>,
    stored_at: Instant,
}

/// Process-wide cache whose entries expire `ttl` after they were stored.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh entry, or `None` when missing or expired.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        match self.lookup(key) {
            Lookup::Fresh(value) => Some(value),
            _ => None,
        }
    }

    pub fn lookup(&self, key: &K) -> Lookup<V> {
        // A poisoned lock only means a panicking writer; the map itself is intact
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                Lookup::Fresh(Arc::clone(&entry.value))
            }
            Some(entry) => Lookup::Stale(Arc::clone(&entry.value)),
            None => Lookup::Missing,
        }
    }

    /// Replace the entry for `key` in one step and return the shared value.
    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            Entry {
                value: Arc::clone(&value),
                stored_at: Instant::now(),
            },
        );
        value
    }

    /// Entries held, fresh or stale.
    pub(crate) fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache").field("ttl", &self.ttl).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_is_fresh_until_ttl() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(300));
        cache.insert("k", 1);
        assert_eq!(cache.get(&"k").as_deref(), Some(&1));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(matches!(cache.lookup(&"k"), Lookup::Fresh(_)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&"k").is_none());
        assert!(matches!(cache.lookup(&"k"), Lookup::Stale(v) if *v == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_replaces_and_resets_age() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(10));
        let first = cache.insert("k", 1);
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.insert("k", 2);
        assert_eq!(cache.get(&"k").as_deref(), Some(&2));
        // Earlier snapshots are unaffected by replacement
        assert_eq!(*first, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_outcome_labels() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(10));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.lookup(&"x".to_string()).outcome(), "miss");
        cache.insert("x".to_string(), 5);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&"x".to_string()).outcome(), "hit");
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.lookup(&"x".to_string()).outcome(), "stale");
    }
}
