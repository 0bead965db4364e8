/// Working memory: bounded priority store with automatic expiry.
///
/// The agent's scratchpad - small, fast, and forgetful. Items carry a
/// priority and a TTL; the store enforces a capacity bound by evicting the
/// lowest-priority item (least-recently-accessed among equals) and treats
/// any item past its TTL as absent.
///
/// Expiry is a pure predicate over stored timestamps, so a lazy check at
/// `get` and a concurrent sweep always agree. The sweep only reclaims
/// storage; it is never required for correctness. Per item the lifecycle is
/// `Active -> Expired` or `Active -> Evicted`, both terminal and both
/// unobservable to `get`/`peek_all`.
///
/// Contents are transient and excluded from snapshots.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

/// Working memory configuration.
#[derive(Debug, Clone)]
pub struct WorkingConfig {
    /// Maximum live items
    pub capacity: usize,

    /// Interval for the optional background sweep; `None` disables it
    pub sweep_interval: Option<Duration>,
}

impl Default for WorkingConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            sweep_interval: None,
        }
    }
}

/// One item held in working memory.
#[derive(Debug, Clone)]
pub struct WorkingItem {
    /// Lookup key
    pub key: String,
    /// The held value
    pub value: JsonValue,
    /// Eviction priority; higher survives longer
    pub priority: f64,
    /// When the item was (re)set
    pub created_at: DateTime<Utc>,
    /// Time to live from `created_at`
    pub ttl: Duration,
    /// Last `get` hit (or creation)
    pub last_accessed: DateTime<Utc>,
    /// Number of `get` hits
    pub access_count: u32,
}

impl WorkingItem {
    fn new(key: String, value: JsonValue, priority: f64, ttl: Duration) -> Self {
        let created_at = Utc::now();
        Self {
            key,
            value,
            priority,
            created_at,
            ttl,
            last_accessed: created_at,
            access_count: 0,
        }
    }

    /// Pure expiry predicate: `created_at + ttl` has elapsed.
    ///
    /// A function of stored timestamps only, so every reader and the sweep
    /// agree about expiry without coordination.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match ChronoDuration::from_std(self.ttl) {
            Ok(ttl) => match self.created_at.checked_add_signed(ttl) {
                Some(deadline) => now >= deadline,
                None => false, // deadline beyond representable time
            },
            Err(_) => false, // TTL too large to ever elapse
        }
    }
}

/// Bounded priority store with TTL expiry.
pub struct WorkingMemory {
    config: WorkingConfig,

    items: DashMap<String, WorkingItem>,

    /// Serializes `set`, eviction, and sweep; `get` stays lock-free
    write_lock: Mutex<()>,

    inserted: AtomicUsize,
    evicted: AtomicUsize,
    expired: AtomicUsize,
}

impl std::fmt::Debug for WorkingMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingMemory")
            .field("len", &self.items.len())
            .field("capacity", &self.config.capacity)
            .finish()
    }
}

impl WorkingMemory {
    /// Create working memory with default configuration.
    pub fn new() -> Self {
        Self::with_config(WorkingConfig::default())
    }

    /// Create working memory with custom configuration.
    pub fn with_config(config: WorkingConfig) -> Self {
        let capacity = config.capacity;
        Self {
            config,
            items: DashMap::with_capacity(capacity),
            write_lock: Mutex::new(()),
            inserted: AtomicUsize::new(0),
            evicted: AtomicUsize::new(0),
            expired: AtomicUsize::new(0),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store an item, replacing any existing item under the same key.
    ///
    /// When inserting a new key at capacity, expired items are dropped
    /// first; if still full, the lowest-priority item is evicted, ties
    /// broken by least-recently-accessed, then key. A long remaining TTL
    /// never exempts an item from priority-based eviction.
    pub fn set(&self, key: impl Into<String>, value: JsonValue, priority: f64, ttl: Duration) {
        let key = key.into();
        let _guard = self.guard();

        let replacing = self.items.contains_key(&key);
        if !replacing && self.items.len() >= self.config.capacity {
            let reclaimed = self.reclaim_expired();
            if reclaimed == 0 || self.items.len() >= self.config.capacity {
                self.evict_victim();
            }
        }

        self.items
            .insert(key.clone(), WorkingItem::new(key.clone(), value, priority, ttl));
        self.inserted.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, priority, "working item set");
    }

    /// Look up an item. Expired items are absent - checked lazily via the
    /// pure predicate and reclaimed on this touch. Hits refresh
    /// `last_accessed` and the access count.
    pub fn get(&self, key: &str) -> Option<JsonValue> {
        let now = Utc::now();

        let expired = match self.items.get_mut(key) {
            Some(mut item) => {
                if item.is_expired(now) {
                    true
                } else {
                    item.last_accessed = now;
                    item.access_count += 1;
                    return Some(item.value.clone());
                }
            }
            None => return None,
        };

        if expired {
            self.items.remove(key);
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Observe an item without refreshing its recency.
    pub fn peek(&self, key: &str) -> Option<WorkingItem> {
        let now = Utc::now();
        self.items
            .get(key)
            .filter(|item| !item.is_expired(now))
            .map(|item| item.clone())
    }

    /// Snapshot of all non-expired items, priority descending, ties broken
    /// by most-recently-accessed, then key.
    pub fn peek_all(&self) -> Vec<WorkingItem> {
        let now = Utc::now();
        let mut snapshot: Vec<WorkingItem> = self
            .items
            .iter()
            .filter(|item| !item.is_expired(now))
            .map(|item| item.clone())
            .collect();
        snapshot.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then_with(|| b.last_accessed.cmp(&a.last_accessed))
                .then_with(|| a.key.cmp(&b.key))
        });
        snapshot
    }

    /// Change an item's priority in place. Returns false for absent or
    /// expired items.
    pub fn set_priority(&self, key: &str, priority: f64) -> bool {
        let _guard = self.guard();
        let now = Utc::now();
        match self.items.get_mut(key) {
            Some(mut item) if !item.is_expired(now) => {
                item.priority = priority;
                true
            }
            _ => false,
        }
    }

    /// Remove an item explicitly, returning its value if it was live.
    pub fn remove(&self, key: &str) -> Option<JsonValue> {
        let _guard = self.guard();
        let now = Utc::now();
        let (_, item) = self.items.remove(key)?;
        if item.is_expired(now) {
            self.expired.fetch_add(1, Ordering::Relaxed);
            None
        } else {
            Some(item.value)
        }
    }

    /// Reclaim storage for expired items, off the read path.
    ///
    /// An optimization only - `get` and `peek_all` already treat expired
    /// items as absent without it.
    pub fn sweep(&self) -> usize {
        let _guard = self.guard();
        self.reclaim_expired()
    }

    /// Number of resident items (expired-but-unswept included).
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// The configured sweep interval, if any.
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.config.sweep_interval
    }

    /// Working memory statistics.
    pub fn stats(&self) -> WorkingStats {
        WorkingStats {
            inserted: self.inserted.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            len: self.items.len(),
            capacity: self.config.capacity,
        }
    }

    /// Drop everything (restore path).
    pub fn clear(&self) {
        let _guard = self.guard();
        self.items.clear();
    }

    /// Drop expired items now. Caller holds the write lock.
    fn reclaim_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .items
            .iter()
            .filter(|item| item.is_expired(now))
            .map(|item| item.key().clone())
            .collect();
        for key in &expired {
            self.items.remove(key);
        }
        self.expired.fetch_add(expired.len(), Ordering::Relaxed);
        expired.len()
    }

    /// Evict the lowest-priority item, LRU among equals, key as final
    /// tie-break for determinism. Caller holds the write lock.
    fn evict_victim(&self) {
        let victim = self
            .items
            .iter()
            .min_by(|a, b| {
                a.priority
                    .total_cmp(&b.priority)
                    .then_with(|| a.last_accessed.cmp(&b.last_accessed))
                    .then_with(|| a.key().cmp(b.key()))
            })
            .map(|item| item.key().clone());

        if let Some(key) = victim {
            self.items.remove(&key);
            self.evicted.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "working item evicted");
        }
    }
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// Working memory statistics.
#[derive(Debug, Clone)]
pub struct WorkingStats {
    pub inserted: usize,
    pub evicted: usize,
    pub expired: usize,
    pub len: usize,
    pub capacity: usize,
}
