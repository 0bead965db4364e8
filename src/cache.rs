/// Recall cache: bounded LRU with per-entry TTL, fronting the record store.
///
/// A pure acceleration structure. The cache never talks to persistence -
/// stores populate it on miss and invalidate it on write (cache-aside) - so
/// its contents are always rebuildable and losing it never loses data.
///
/// ## Expiry
///
/// TTL is checked lazily at every access: an entry past its deadline is
/// treated as a miss even if still resident, and purged on that touch.
/// [`RecallCache::purge_expired`] exists as an opportunistic sweep; it is an
/// optimization, never required for correctness.
///
/// ## Eviction
///
/// On overflow, expired entries go first, then strict LRU among the rest.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::trace;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum resident entries
    pub capacity: usize,

    /// TTL applied when `put` is called without one; `None` means entries
    /// without an explicit TTL never expire
    pub default_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            default_ttl: Some(Duration::from_secs(300)),
        }
    }
}

/// A resident cache entry. Transient and rebuildable; never source of truth.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: JsonValue,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    last_accessed: DateTime<Utc>,
    access_count: u32,
}

impl CacheEntry {
    fn new(value: JsonValue, ttl: Option<Duration>) -> Self {
        let created_at = Utc::now();
        let expires_at = ttl
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .and_then(|d| created_at.checked_add_signed(d));
        Self {
            value,
            created_at,
            expires_at,
            last_accessed: created_at,
            access_count: 0,
        }
    }

    /// Pure expiry predicate over stored timestamps.
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Bounded LRU + TTL cache keyed by string.
pub struct RecallCache {
    config: CacheConfig,

    /// Resident entries
    entries: DashMap<String, CacheEntry>,

    /// Access order for LRU (front = most recent)
    access_order: Mutex<VecDeque<String>>,

    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
    expirations: AtomicUsize,
}

impl std::fmt::Debug for RecallCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecallCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.config.capacity)
            .finish()
    }
}

impl RecallCache {
    /// Create a cache with default configuration.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create a cache with custom configuration.
    pub fn with_config(config: CacheConfig) -> Self {
        let capacity = config.capacity;
        Self {
            config,
            entries: DashMap::with_capacity(capacity),
            access_order: Mutex::new(VecDeque::with_capacity(capacity)),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
            expirations: AtomicUsize::new(0),
        }
    }

    /// Get a value. Expired entries are a miss and are purged on this touch;
    /// hits refresh recency.
    pub fn get(&self, key: &str) -> Option<JsonValue> {
        let now = Utc::now();

        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.is_expired(now) {
                    true
                } else {
                    entry.last_accessed = now;
                    entry.access_count += 1;
                    let value = entry.value.clone();
                    drop(entry);

                    self.touch(key);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            self.entries.remove(key);
            self.forget(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert a value with an explicit TTL, or the configured default when
    /// `None`. Evicts on overflow: expired entries first, then strict LRU.
    pub fn put(&self, key: impl Into<String>, value: JsonValue, ttl: Option<Duration>) {
        let key = key.into();
        let ttl = ttl.or(self.config.default_ttl);

        let is_new = !self.entries.contains_key(&key);
        if is_new && self.entries.len() >= self.config.capacity {
            let reclaimed = self.purge_expired();
            if reclaimed == 0 || self.entries.len() >= self.config.capacity {
                self.evict_lru();
            }
        }

        self.entries.insert(key.clone(), CacheEntry::new(value, ttl));
        self.touch(&key);
        trace!(key = %key, "cache entry stored");
    }

    /// Drop an entry regardless of TTL. A no-op for absent keys.
    pub fn invalidate(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.forget(key);
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.clear();
        if let Ok(mut order) = self.access_order.lock() {
            order.clear();
        }
    }

    /// Opportunistic sweep: reclaim every expired entry now.
    ///
    /// Returns the number reclaimed. Correctness never depends on this
    /// running - `get` applies the same predicate lazily.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
            self.forget(key);
        }
        self.expirations.fetch_add(expired.len(), Ordering::Relaxed);
        expired.len()
    }

    /// Number of resident entries (expired-but-unswept included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            len: self.entries.len(),
            capacity: self.config.capacity,
        }
    }

    /// Move a key to the most-recent position.
    fn touch(&self, key: &str) {
        if let Ok(mut order) = self.access_order.lock() {
            order.retain(|k| k != key);
            order.push_front(key.to_string());
        }
    }

    /// Remove a key from the recency order.
    fn forget(&self, key: &str) {
        if let Ok(mut order) = self.access_order.lock() {
            order.retain(|k| k != key);
        }
    }

    /// Evict the least-recently-used resident entry.
    fn evict_lru(&self) {
        let victim = {
            let Ok(mut order) = self.access_order.lock() else {
                return;
            };
            // The deque may hold keys already invalidated; skip them.
            loop {
                match order.pop_back() {
                    Some(key) if self.entries.contains_key(&key) => break Some(key),
                    Some(_) => continue,
                    None => break None,
                }
            }
        };

        if let Some(key) = victim {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "cache entry evicted");
        }
    }
}

impl Default for RecallCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub expirations: usize,
    pub len: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Hit rate over all lookups (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_cache(capacity: usize) -> RecallCache {
        RecallCache::with_config(CacheConfig {
            capacity,
            default_ttl: None,
        })
    }

    #[test]
    fn test_put_and_get() {
        let cache = small_cache(4);
        cache.put("a", json!(1), None);

        assert_eq!(cache.get("a"), Some(json!(1)));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_ttl_expiry_without_sweep() {
        let cache = small_cache(4);
        cache.put("a", json!(1), Some(Duration::from_millis(20)));

        assert_eq!(cache.get("a"), Some(json!(1)));
        std::thread::sleep(Duration::from_millis(40));

        // No sweep ran; the lazy check alone must report the miss
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = small_cache(2);
        cache.put("a", json!(1), None);
        cache.put("b", json!(2), None);

        // Touch "a" so "b" is least recent
        cache.get("a");

        cache.put("c", json!(3), None);

        assert_eq!(cache.get("b"), None, "b was LRU and should be evicted");
        assert_eq!(cache.get("a"), Some(json!(1)));
        assert_eq!(cache.get("c"), Some(json!(3)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_expired_entries_evicted_before_lru() {
        let cache = small_cache(2);
        cache.put("stale", json!(0), Some(Duration::from_millis(10)));
        cache.put("fresh", json!(1), None);
        std::thread::sleep(Duration::from_millis(30));

        cache.put("new", json!(2), None);

        // The expired entry was reclaimed; the fresh one survived overflow
        assert_eq!(cache.get("fresh"), Some(json!(1)));
        assert_eq!(cache.get("new"), Some(json!(2)));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_invalidate() {
        let cache = small_cache(4);
        cache.put("a", json!(1), None);
        cache.invalidate("a");
        assert_eq!(cache.get("a"), None);

        // Invalidating an absent key is a no-op
        cache.invalidate("missing");
    }

    #[test]
    fn test_purge_expired_sweep() {
        let cache = small_cache(8);
        cache.put("a", json!(1), Some(Duration::from_millis(10)));
        cache.put("b", json!(2), Some(Duration::from_millis(10)));
        cache.put("c", json!(3), None);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[test]
    fn test_hit_rate() {
        let cache = small_cache(4);
        cache.put("a", json!(1), None);

        cache.get("a");
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 0.01);
    }

    #[test]
    fn test_update_existing_key_does_not_evict() {
        let cache = small_cache(2);
        cache.put("a", json!(1), None);
        cache.put("b", json!(2), None);
        cache.put("a", json!(10), None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(json!(10)));
        assert_eq!(cache.get("b"), Some(json!(2)));
    }
}
